use lentil::sync::*;
use lentil::LentilError;

#[derive(Default)]
struct Recorder {
    history: Vec<Vec<f64>>,
}

impl Replica for Recorder {
    fn apply_parameters(&mut self, theta: &[f64]) -> anyhow::Result<()> {
        self.history.push(theta.to_vec());
        Ok(())
    }
}

#[test]
fn followers_mirror_every_update_then_stop() {
    let mut comms = LocalComm::group(3);
    let root = comms.remove(0);

    let updates = vec![vec![0.1, -2.5, 3.0], vec![1.0 / 3.0, f64::MIN_POSITIVE, -0.0]];

    let followers: Vec<_> = comms
        .into_iter()
        .map(|comm| {
            std::thread::spawn(move || {
                let mut replica = Recorder::default();
                let applied = follow(&comm, &mut replica).unwrap();
                (applied, replica.history)
            })
        })
        .collect();

    for theta in updates.iter() {
        broadcast_update(&root, theta).unwrap();
    }
    broadcast_stop(&root).unwrap();

    for handle in followers {
        let (applied, history) = handle.join().unwrap();
        assert_eq!(applied, 2);
        assert_eq!(history.len(), updates.len());
        for (got, sent) in history.iter().zip(updates.iter()) {
            let got: Vec<u64> = got.iter().map(|x| x.to_bits()).collect();
            let sent: Vec<u64> = sent.iter().map(|x| x.to_bits()).collect();
            assert_eq!(got, sent);
        }
    }
}

#[test]
fn immediate_stop_applies_nothing() {
    let mut comms = LocalComm::group(2);
    let follower = comms.pop().unwrap();
    let root = comms.pop().unwrap();

    let handle = std::thread::spawn(move || {
        let mut replica = Recorder::default();
        follow(&follower, &mut replica).unwrap()
    });
    broadcast_stop(&root).unwrap();
    assert_eq!(handle.join().unwrap(), 0);
}

#[test]
fn unknown_signal_is_a_protocol_error() {
    let mut comms = LocalComm::group(2);
    let follower = comms.pop().unwrap();
    let root = comms.pop().unwrap();

    let handle = std::thread::spawn(move || {
        let mut replica = Recorder::default();
        let err = follow(&follower, &mut replica).unwrap_err();
        (replica.history.len(), err)
    });

    let mut signal = 7;
    root.broadcast_signal(&mut signal, 0).unwrap();

    let (applied, err) = handle.join().unwrap();
    assert_eq!(applied, 0);
    match err.downcast_ref::<LentilError>() {
        Some(LentilError::Protocol { rank, signal }) => {
            assert_eq!(*rank, 1);
            assert_eq!(*signal, 7);
        }
        other => panic!("expected a protocol error, got {:?}", other),
    }
}

#[test]
fn collectives_agree_on_every_worker() {
    let comms = LocalComm::group(4);
    let handles: Vec<_> = comms
        .into_iter()
        .map(|comm| {
            std::thread::spawn(move || {
                let rank = comm.rank() as f64;
                let mut buf = vec![rank, 0.1 * rank, 1.0];
                comm.allreduce_sum(&mut buf).unwrap();

                let local = vec![rank; comm.rank() + 1];
                let gathered = comm.allgather(&local).unwrap();
                (buf, gathered)
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let (first_sum, first_gathered) = &results[0];
    assert_eq!(first_sum[0], 6.0);
    assert_eq!(first_sum[2], 4.0);
    for (r, part) in first_gathered.iter().enumerate() {
        assert_eq!(part, &vec![r as f64; r + 1]);
    }
    for (sum, gathered) in results.iter() {
        let a: Vec<u64> = sum.iter().map(|x| x.to_bits()).collect();
        let b: Vec<u64> = first_sum.iter().map(|x| x.to_bits()).collect();
        assert_eq!(a, b);
        assert_eq!(gathered, first_gathered);
    }
}

#[test]
fn partition_covers_rows_once() {
    let n = 23;
    let workers = 4;
    let mut covered = vec![0; n];
    for rank in 0..workers {
        let part = RowPartition::new(n, rank, workers).unwrap();
        assert_eq!(part.table, divide_rows(n, workers));
        for i in part.start..part.end {
            covered[i] += 1;
        }
    }
    assert!(covered.iter().all(|&c| c == 1));
}
