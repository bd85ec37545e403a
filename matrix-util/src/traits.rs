use rand::Rng;

/// Standardize or centre columns
pub trait MatOps {
    type Mat;
    type Scalar;
    type DVec;

    /// `X[,j] -= mean(X[,j])`
    fn centre_columns_inplace(&mut self);
    fn centre_columns(&self) -> Self::Mat;

    /// `X[,j] = (X[,j] - mean(X[,j])) / sd(X[,j])`; constant columns
    /// are only centred
    fn scale_columns_inplace(&mut self);

    /// Population variance of each column
    fn column_variances(&self) -> Self::DVec;
}

/// Operations to sample random matrices. `runif` draws from the
/// thread-local generator in parallel; the `_rng` versions take a
/// caller's generator so that a seed reproduces the draw.
pub trait SampleOps {
    type Mat;
    type Scalar;

    /// Sample a matrix from a uniform distribution `U(0,1)`
    fn runif(nrow: usize, ncol: usize) -> Self::Mat;

    /// Sample a matrix from `U(lb, ub)`
    fn runif_rng<R: Rng + ?Sized>(
        nrow: usize,
        ncol: usize,
        lb: Self::Scalar,
        ub: Self::Scalar,
        rng: &mut R,
    ) -> anyhow::Result<Self::Mat>;

    /// Sample a matrix from `N(0,1)`
    fn rnorm_rng<R: Rng + ?Sized>(nrow: usize, ncol: usize, rng: &mut R) -> Self::Mat;
}

/// Delimited text files of numbers, one matrix row per line
pub trait IoOps {
    type Mat;

    /// `skip` drops that many leading non-comment lines
    fn read_file_delim(file: &str, delim: char, skip: Option<usize>) -> anyhow::Result<Self::Mat>;

    fn from_tsv(tsv_file: &str, skip: Option<usize>) -> anyhow::Result<Self::Mat> {
        Self::read_file_delim(tsv_file, '\t', skip)
    }

    fn write_file_delim(&self, file: &str, delim: char) -> anyhow::Result<()>;

    fn to_tsv(&self, tsv_file: &str) -> anyhow::Result<()> {
        self.write_file_delim(tsv_file, '\t')
    }
}
