/// Checkpoint round trip: frozen weights and biases survive alongside scores.

use supermask_core::checkpoint::{TensorRecord, TensorRole};
use supermask_core::conv::Conv2dGeometry;
use supermask_core::{
    load_checkpoint, save_checkpoint, Conv2dSubnet, Layer, LinearConfig, LinearSubnet, Sequential,
    SubnetConfig, SubnetError, Tensor,
};

fn model(seed: u64) -> Layer {
    let cfg = SubnetConfig::with_k(0.4).unwrap().seeded(seed);
    let mut seq = Sequential::new();
    seq.push("conv", Layer::Conv2dSubnet(Conv2dSubnet::new(Conv2dGeometry::new(2, 4, 3), true, &cfg).unwrap()));
    seq.push("act", Layer::Relu);
    seq.push("flat", Layer::Flatten);
    seq.push("fc", Layer::LinearSubnet(LinearSubnet::new(LinearConfig::new(16, 3, true), &cfg).unwrap()));
    seq.into()
}

#[test]
fn test_save_load_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("subnet.json");

    let src = model(1);
    save_checkpoint(&path, &src.state_dict()).unwrap();
    let loaded = load_checkpoint(&path).unwrap();
    assert_eq!(loaded, src.state_dict());

    let names: Vec<&str> = loaded.names().collect();
    assert_eq!(
        names,
        vec!["conv.bias", "conv.popup_scores", "conv.weight", "fc.bias", "fc.popup_scores", "fc.weight"]
    );
    assert!(matches!(loaded.get("fc.weight"), Some(TensorRecord { role: TensorRole::Frozen, .. })));
    assert!(matches!(loaded.get("fc.popup_scores"), Some(TensorRecord { role: TensorRole::Trainable, .. })));

    let mut dst = model(2);
    assert_ne!(dst.state_dict(), src.state_dict());
    dst.load_state_dict(&loaded).unwrap();
    assert_eq!(dst.state_dict(), src.state_dict());

    let x = Tensor::from_vec((0..2 * 2 * 4 * 4).map(|i| (i as f32 * 0.05).cos()).collect(), &[2, 2, 4, 4]).unwrap();
    assert_eq!(dst.forward(&x).unwrap(), src.forward(&x).unwrap());
}

#[test]
fn test_load_rejects_shape_mismatch() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("small.json");
    let cfg = SubnetConfig::default().seeded(0);
    let small = LinearSubnet::new(LinearConfig::new(2, 2, false), &cfg).unwrap();
    save_checkpoint(&path, &small.state_dict()).unwrap();

    let mut big = LinearSubnet::new(LinearConfig::new(3, 2, false), &cfg).unwrap();
    let err = big.load_state_dict(&load_checkpoint(&path).unwrap());
    assert!(matches!(err, Err(SubnetError::ShapeMismatch { .. })));
}

#[test]
fn test_missing_file_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = load_checkpoint(&dir.path().join("absent.json"));
    assert!(matches!(err, Err(SubnetError::Checkpoint(_))));
}

#[test]
fn test_corrupt_file_is_serialization_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.json");
    std::fs::write(&path, "{ not json").unwrap();
    assert!(matches!(load_checkpoint(&path), Err(SubnetError::Serialization(_))));
}
