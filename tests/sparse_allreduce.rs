mod common;

use cohort::{CohortError, DeviceKind, ReduceOp, Tensor};
use common::{run_ranks, single_rank_group};

#[test]
fn test_sparse_allreduce_one_entry_per_rank() {
    // Rank r contributes coo indices [[r]], values [1.0], shape [4].
    run_ranks(4, 1, |group| {
        let rank = group.rank();
        let input =
            Tensor::sparse_coo(&[rank as i64], &[1.0f32], &[4], 1, DeviceKind::Cpu).unwrap();
        let work = group.allreduce(&[input.clone()], ReduceOp::Sum).unwrap();
        work.wait().unwrap();

        // The caller observes the result through the tensor it passed in.
        assert!(input.is_coalesced().unwrap());
        assert_eq!(input.nnz().unwrap(), 4);
        assert_eq!(input.shape(), vec![4]);
        assert_eq!(
            input.to_dense().unwrap().to_vec::<f32>().unwrap(),
            vec![1.0, 1.0, 1.0, 1.0]
        );

        // result() reports the same tensors.
        let outputs = work.result();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].nnz().unwrap(), 4);
    });
}

#[test]
fn test_sparse_allreduce_empty_on_some_ranks() {
    run_ranks(4, 1, |group| {
        let rank = group.rank();
        let input = if rank < 2 {
            Tensor::sparse_coo::<f32>(&[], &[], &[4], 1, DeviceKind::Cpu).unwrap()
        } else {
            Tensor::sparse_coo(&[rank as i64], &[rank as f32], &[4], 1, DeviceKind::Cpu).unwrap()
        };
        group
            .allreduce(&[input.clone()], ReduceOp::Sum)
            .unwrap()
            .wait()
            .unwrap();
        assert_eq!(input.nnz().unwrap(), 2);
        assert_eq!(
            input.to_dense().unwrap().to_vec::<f32>().unwrap(),
            vec![0.0, 0.0, 2.0, 3.0]
        );
    });
}

#[test]
fn test_sparse_allreduce_overlapping_duplicates() {
    // Every rank contributes two entries at the same coordinate; the
    // result must be coalesced with the duplicates summed.
    run_ranks(4, 1, |group| {
        let input = Tensor::sparse_coo(
            &[0, 0],
            &[1.0f64, 1.0],
            &[4],
            1,
            DeviceKind::Cpu,
        )
        .unwrap();
        group
            .allreduce(&[input.clone()], ReduceOp::Sum)
            .unwrap()
            .wait()
            .unwrap();
        assert!(input.is_coalesced().unwrap());
        assert_eq!(input.nnz().unwrap(), 1);
        assert_eq!(
            input.to_dense().unwrap().to_vec::<f64>().unwrap(),
            vec![8.0, 0.0, 0.0, 0.0]
        );
    });
}

#[test]
fn test_sparse_allreduce_dense_blocks() {
    // Shape [4, 2] with sparse_dim 1: each entry carries a length-2 block.
    run_ranks(4, 1, |group| {
        let rank = group.rank();
        let input = Tensor::sparse_coo(
            &[rank as i64],
            &[rank as f32, 10.0 * rank as f32],
            &[4, 2],
            1,
            DeviceKind::Cpu,
        )
        .unwrap();
        group
            .allreduce(&[input.clone()], ReduceOp::Sum)
            .unwrap()
            .wait()
            .unwrap();
        let dense = input.to_dense().unwrap().to_vec::<f32>().unwrap();
        assert_eq!(
            dense,
            vec![0.0, 0.0, 1.0, 10.0, 2.0, 20.0, 3.0, 30.0]
        );
    });
}

#[test]
fn test_sparse_allreduce_local_list_reduction() {
    // Two local inputs per rank get summed before the exchange, and both
    // handles are overwritten with independent clones of the result.
    run_ranks(2, 1, |group| {
        let rank = group.rank() as i64;
        let a = Tensor::sparse_coo(&[rank], &[1.0f32], &[4], 1, DeviceKind::Cpu).unwrap();
        let b = Tensor::sparse_coo(&[rank + 2], &[2.0f32], &[4], 1, DeviceKind::Cpu).unwrap();
        group
            .allreduce(&[a.clone(), b.clone()], ReduceOp::Sum)
            .unwrap()
            .wait()
            .unwrap();

        let expected = vec![1.0, 1.0, 2.0, 2.0];
        assert_eq!(a.to_dense().unwrap().to_vec::<f32>().unwrap(), expected);
        assert_eq!(b.to_dense().unwrap().to_vec::<f32>().unwrap(), expected);

        // The clones are independent: writing one does not affect the other.
        let other = Tensor::sparse_coo(&[0], &[9.0f32], &[4], 1, DeviceKind::Cpu).unwrap();
        a.assign(&other).unwrap();
        assert_eq!(b.to_dense().unwrap().to_vec::<f32>().unwrap(), expected);
    });
}

#[test]
fn test_sparse_allreduce_two_sparse_dims() {
    run_ranks(2, 1, |group| {
        let rank = group.rank() as i64;
        // Entry at (rank, rank) of a 2x2 matrix.
        let input = Tensor::sparse_coo(
            &[rank, rank],
            &[1.0f64],
            &[2, 2],
            2,
            DeviceKind::Cpu,
        )
        .unwrap();
        group
            .allreduce(&[input.clone()], ReduceOp::Sum)
            .unwrap()
            .wait()
            .unwrap();
        assert_eq!(
            input.to_dense().unwrap().to_vec::<f64>().unwrap(),
            vec![1.0, 0.0, 0.0, 1.0]
        );
    });
}

#[test]
fn test_sparse_allreduce_requires_sum() {
    let group = single_rank_group();
    let input = Tensor::sparse_coo(&[0], &[1.0f32], &[4], 1, DeviceKind::Cpu).unwrap();
    let err = group.allreduce(&[input], ReduceOp::Max).unwrap_err();
    assert!(matches!(err, CohortError::Unsupported { .. }));
}

#[test]
fn test_sparse_allreduce_shape_mismatch_is_runtime() {
    run_ranks(2, 1, |group| {
        let len = if group.rank() == 0 { 4 } else { 5 };
        let input = Tensor::sparse_coo(&[0], &[1.0f32], &[len], 1, DeviceKind::Cpu).unwrap();
        let work = group.allreduce(&[input], ReduceOp::Sum).unwrap();
        let err = work.wait().unwrap_err();
        assert!(matches!(err, CohortError::Runtime(_)));
    });
}

#[test]
fn test_sparse_dims_hard_limit() {
    let group = single_rank_group();
    // 5 sparse dimensions exceed the metadata record.
    let input = Tensor::sparse_coo(
        &[0, 0, 0, 0, 0],
        &[1.0f32],
        &[2, 2, 2, 2, 2],
        5,
        DeviceKind::Cpu,
    )
    .unwrap();
    assert!(group.allreduce(&[input], ReduceOp::Sum).is_err());
}
