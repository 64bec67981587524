mod common;

use cohort::{DeviceKind, ReduceOp, ScalarType, Tensor};
use common::{run_ranks, single_rank_group};

#[test]
fn test_send_recv_pair() {
    run_ranks(2, 1, |group| {
        if group.rank() == 0 {
            let t = Tensor::from_slice(&[3.5f32, -1.25, 0.5], &[3], DeviceKind::Cpu).unwrap();
            group.send(&[t], 1, 0).unwrap().wait().unwrap();
        } else {
            let t = Tensor::zeros(&[3], ScalarType::F32, DeviceKind::Cpu);
            let work = group.recv(&[t.clone()], 0, 0).unwrap();
            work.wait().unwrap();
            assert_eq!(t.to_vec::<f32>().unwrap(), vec![3.5, -1.25, 0.5]);
            assert_eq!(work.source_rank(), Some(0));
        }
    });
}

#[test]
fn test_send_recv_max_tag() {
    run_ranks(2, 1, |group| {
        let tag = i32::MAX;
        if group.rank() == 1 {
            let t = Tensor::from_slice(&[42i64], &[1], DeviceKind::Cpu).unwrap();
            group.send(&[t], 0, tag).unwrap().wait().unwrap();
        } else {
            let t = Tensor::zeros(&[1], ScalarType::I64, DeviceKind::Cpu);
            group.recv(&[t.clone()], 1, tag).unwrap().wait().unwrap();
            assert_eq!(t.to_vec::<i64>().unwrap(), vec![42]);
        }
    });
}

#[test]
fn test_negative_tag_is_invalid() {
    let group = single_rank_group();
    let t = Tensor::zeros(&[1], ScalarType::F32, DeviceKind::Cpu);
    assert!(group.send(&[t.clone()], 0, -1).is_err());
    assert!(group.recv(&[t.clone()], 0, -1).is_err());
    assert!(group.recv_anysource(&[t], -7).is_err());
}

#[test]
fn test_send_requires_single_dense_tensor() {
    let group = single_rank_group();
    let a = Tensor::zeros(&[1], ScalarType::F32, DeviceKind::Cpu);
    let b = Tensor::zeros(&[1], ScalarType::F32, DeviceKind::Cpu);
    assert!(group.send(&[a.clone(), b], 0, 1).is_err());

    let sparse = Tensor::sparse_coo(&[0], &[1.0f32], &[4], 1, DeviceKind::Cpu).unwrap();
    assert!(group.send(&[sparse], 0, 1).is_err());
}

#[test]
fn test_recv_anysource_reports_sender() {
    run_ranks(4, 1, |group| {
        if group.rank() == 0 {
            let t = Tensor::zeros(&[1], ScalarType::I32, DeviceKind::Cpu);
            let work = group.recv_anysource(&[t.clone()], 5).unwrap();
            work.wait().unwrap();
            let src = work.source_rank().expect("source resolved after wait");
            assert_eq!(t.to_vec::<i32>().unwrap(), vec![src as i32 * 100]);
            assert_eq!(src, 3);
        } else if group.rank() == 3 {
            let t = Tensor::from_slice(&[300i32], &[1], DeviceKind::Cpu).unwrap();
            group.send(&[t], 0, 5).unwrap().wait().unwrap();
        }
    });
}

#[test]
fn test_send_recv_interleaved_with_collectives() {
    run_ranks(2, 1, |group| {
        let t = Tensor::from_slice(&[group.rank() as i32 + 1], &[1], DeviceKind::Cpu).unwrap();
        let ar = group.allreduce(&[t.clone()], ReduceOp::Sum).unwrap();

        if group.rank() == 0 {
            let msg = Tensor::from_slice(&[9i32], &[1], DeviceKind::Cpu).unwrap();
            group.send(&[msg], 1, 17).unwrap().wait().unwrap();
        } else {
            let msg = Tensor::zeros(&[1], ScalarType::I32, DeviceKind::Cpu);
            group.recv(&[msg.clone()], 0, 17).unwrap().wait().unwrap();
            assert_eq!(msg.to_vec::<i32>().unwrap(), vec![9]);
        }

        ar.wait().unwrap();
        assert_eq!(t.to_vec::<i32>().unwrap(), vec![3]);
    });
}
