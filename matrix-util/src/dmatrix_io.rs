use crate::common_io::{mkdir_parent, read_data_lines, write_lines};
use crate::traits::IoOps;
use nalgebra::DMatrix;
use rayon::prelude::*;

use std::fmt::Display;
use std::str::FromStr;

impl<T> IoOps for DMatrix<T>
where
    T: nalgebra::Scalar + Send + FromStr + Display + Copy,
    <T as FromStr>::Err: Display,
{
    type Mat = Self;

    fn read_file_delim(file: &str, delim: char, skip: Option<usize>) -> anyhow::Result<Self> {
        let lines = read_data_lines(file, skip.unwrap_or(0))?;
        if lines.is_empty() {
            return Err(anyhow::anyhow!("no data in {}", file));
        }

        // parse rows in parallel; collect keeps them in file order
        let rows = lines
            .par_iter()
            .enumerate()
            .map(|(i, line)| -> anyhow::Result<Vec<T>> {
                line.trim_end()
                    .split(delim)
                    .map(|tok| {
                        tok.trim().parse::<T>().map_err(|e| {
                            anyhow::anyhow!("{}: row {}: cannot parse '{}': {}", file, i + 1, tok, e)
                        })
                    })
                    .collect()
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        let ncols = rows[0].len();
        if let Some((i, row)) = rows.iter().enumerate().find(|(_, r)| r.len() != ncols) {
            return Err(anyhow::anyhow!(
                "{}: row {} has {} columns, expected {}",
                file,
                i + 1,
                row.len(),
                ncols
            ));
        }

        let nrows = rows.len();
        Ok(DMatrix::from_row_iterator(
            nrows,
            ncols,
            rows.into_iter().flatten(),
        ))
    }

    fn write_file_delim(&self, file: &str, delim: char) -> anyhow::Result<()> {
        mkdir_parent(file)?;
        let sep = delim.to_string();
        let lines: Vec<String> = self
            .row_iter()
            .map(|row| {
                row.iter()
                    .map(|x| x.to_string())
                    .collect::<Vec<_>>()
                    .join(&sep)
            })
            .collect();
        write_lines(&lines, file)
    }
}
