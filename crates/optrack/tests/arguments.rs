use std::time::Duration;

use optrack::analysis::BATCH_SIZES_KEY;
use optrack::profiling::KernelRecord;
use optrack::{
    ArgValue, Arguments, BackwardMode, CallArgs, DType, Device, MeasuredOperation,
    MeasurementResult, SpecialOperations, Tensor, Trace, TrackerConfig, Value,
};
use proptest::prelude::*;
use serde_json::json;

fn scalar_value() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::None),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::Int),
        (-1.0e6f64..1.0e6).prop_map(Value::Float),
        "[a-z]{0,8}".prop_map(Value::Str),
        prop::collection::vec(1usize..4, 0..3).prop_map(|dims| Value::Tensor(Tensor::zeros(dims))),
    ]
}

proptest! {
    #[test]
    fn capture_preserves_positional_order(values in prop::collection::vec(scalar_value(), 0..8)) {
        let raw = CallArgs::positional(values.clone());
        let captured = Arguments::from_raw_arguments(&raw);
        prop_assert_eq!(captured.args.len(), values.len());
        for (arg, value) in captured.args.iter().zip(&values) {
            prop_assert_eq!(arg, &ArgValue::from_value(value));
        }
        prop_assert!(captured.kwargs.is_empty());
    }

    #[test]
    fn capture_preserves_keyword_order(names in prop::collection::btree_set("[a-z]{1,6}", 0..6)) {
        let names: Vec<String> = names.into_iter().rev().collect();
        let raw = names
            .iter()
            .enumerate()
            .fold(CallArgs::new(), |args, (i, name)| args.with_kwarg(name.clone(), i as i64));
        let captured = Arguments::from_raw_arguments(&raw);
        let captured_names: Vec<&str> = captured
            .kwargs
            .iter()
            .map(|(name, _)| name.as_str())
            .collect();
        let expected: Vec<&str> = names.iter().map(String::as_str).collect();
        prop_assert_eq!(captured_names, expected);
    }
}

#[test]
fn tensors_are_captured_as_descriptors() {
    let raw = CallArgs::new()
        .with_arg(Tensor::from_i32([2], vec![4, 5]).unwrap())
        .with_kwarg("scale", 0.5);
    let captured = Arguments::from_raw_arguments(&raw);
    assert_eq!(
        captured.args[0],
        ArgValue::Tensor {
            shape: vec![2],
            dtype: DType::I32
        }
    );
    assert_eq!(captured.kwarg("scale"), Some(&ArgValue::Float(0.5)));
}

#[test]
fn trace_serializes_with_stable_field_names() {
    let mut arguments = Arguments::from_raw_arguments(&CallArgs::positional([1, 2]));
    arguments.special.insert(
        BATCH_SIZES_KEY.to_string(),
        ArgValue::List(vec![ArgValue::Int(2)]),
    );
    let forward = MeasurementResult::new(
        1.5,
        vec![KernelRecord::new("gemm", Duration::from_micros(1500)).with_metric("flops", 12.0)],
    );
    let trace = Trace::new(
        Device::host(),
        vec![MeasuredOperation::new(
            "lstm",
            Some(arguments),
            Some(forward),
            None,
            Device::host(),
        )],
    );

    let encoded = serde_json::to_value(&trace).unwrap();
    assert_eq!(encoded["device"], json!({ "name": "host" }));
    let op = &encoded["operations"][0];
    assert_eq!(op["name"], "lstm");
    assert_eq!(op["arguments"]["args"][0], json!({ "kind": "int", "value": 1 }));
    assert_eq!(
        op["arguments"]["special"]["batch_sizes"],
        json!({ "kind": "list", "value": [{ "kind": "int", "value": 2 }] })
    );
    assert_eq!(op["forward"]["kernels"][0]["run_time_ns"], 1_500_000);
    assert!(op["backward"].is_null());

    let decoded: Trace = serde_json::from_value(encoded).unwrap();
    assert_eq!(decoded, trace);
}

#[test]
fn tracker_config_reads_partial_json() {
    let config: TrackerConfig = serde_json::from_value(json!({
        "profiler": { "warm_up": 0, "backward_mode": "queued" },
        "special_operations": ["lstm", "conv2d"],
        "targets": ["lstm"]
    }))
    .unwrap();
    assert_eq!(config.profiler.warm_up, 0);
    assert_eq!(config.profiler.measure_for, 3);
    assert_eq!(config.profiler.backward_mode, BackwardMode::Queued);
    assert_eq!(
        config.special_operations,
        SpecialOperations::from_names(["conv2d", "lstm"])
    );
    assert_eq!(config.targets.as_deref(), Some(&["lstm".to_string()][..]));

    let defaults: TrackerConfig = serde_json::from_value(json!({})).unwrap();
    assert_eq!(defaults, TrackerConfig::default());
}
