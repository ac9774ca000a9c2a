use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

use anyhow::{anyhow, Result};
use optrack::analysis::BATCH_SIZES_KEY;
use optrack::profiling::{Measurement, TimingRequest};
use optrack::{
    op_fn, ArgValue, Arguments, BackwardMode, CallArgs, DType, Device, GradFn, KernelTimer,
    OpTable, OperationTracker, ProfilerConfig, Tensor, Tracker, TrackerConfig, TrackingError,
    Value,
};
use optrack_ops_ref::{random_lstm_params, random_tensor, reference_table};
use rand::rngs::StdRng;
use rand::SeedableRng;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn quick_config() -> TrackerConfig {
    TrackerConfig {
        profiler: ProfilerConfig::single_run(),
        ..TrackerConfig::default()
    }
}

fn tracker_for(table: &Arc<OpTable>) -> OperationTracker {
    OperationTracker::new(Arc::clone(table), Device::host(), quick_config())
        .expect("tracker should construct")
}

struct FailingTimer;

impl KernelTimer for FailingTimer {
    fn measure(
        &self,
        _request: &TimingRequest<'_>,
        _work: &mut dyn FnMut() -> Result<()>,
    ) -> Result<Measurement> {
        Err(anyhow!("timer offline"))
    }
}

#[test]
fn tracked_call_returns_the_real_result() -> Result<()> {
    init_tracing();
    let table = reference_table();
    let mut tracker = tracker_for(&table);

    let result = tracker.tracked(|_| table.call("add", &CallArgs::positional([2, 3])))?;
    assert_eq!(result, Value::Int(5));

    let trace = tracker.get_tracked_trace();
    assert_eq!(trace.len(), 1);
    let op = &trace.operations()[0];
    assert_eq!(op.name(), "add");
    assert!(op.arguments().is_none());
    assert!(op.forward().is_some());
    assert!(op.backward().is_none());
    assert_eq!(op.device(), &Device::host());
    Ok(())
}

#[test]
fn empty_session_produces_an_empty_trace() -> Result<()> {
    let table = reference_table();
    let mut tracker = tracker_for(&table);
    tracker.track()?.finish()?;
    assert!(tracker.get_tracked_trace().is_empty());
    Ok(())
}

#[test]
fn calls_are_recorded_in_order() -> Result<()> {
    let table = reference_table();
    let mut tracker = tracker_for(&table);
    let x = Tensor::from_vec([2, 2], vec![1.0, -1.0, 2.0, -2.0])?;

    tracker.tracked(|_| -> Result<()> {
        table.call("relu", &CallArgs::new().with_arg(x.clone()))?;
        table.call("mul", &CallArgs::new().with_arg(x.clone()).with_arg(3.0))?;
        table.call("sum", &CallArgs::new().with_arg(x.clone()))?;
        Ok(())
    })?;

    let names: Vec<_> = tracker
        .get_tracked_trace()
        .iter()
        .map(|op| op.name().to_string())
        .collect();
    assert_eq!(names, ["relu", "mul", "sum"]);
    Ok(())
}

#[test]
fn nested_operations_are_not_recorded_separately() -> Result<()> {
    let table = reference_table();
    let mut tracker = tracker_for(&table);
    let mut rng = StdRng::seed_from_u64(3);
    let input = random_tensor(&mut rng, [2, 3]);
    let weight = random_tensor(&mut rng, [4, 3]);

    let out = tracker.tracked(|_| {
        table.call(
            "linear",
            &CallArgs::new()
                .with_arg(input.clone())
                .with_arg(weight.clone())
                .with_arg(Tensor::zeros([4])),
        )
    })?;
    assert_eq!(out.as_tensor().map(|t| t.shape().to_vec()), Some(vec![2, 4]));

    let trace = tracker.get_tracked_trace();
    assert_eq!(trace.len(), 1);
    let linear = &trace.operations()[0];
    assert_eq!(linear.name(), "linear");

    let arguments = linear.arguments().expect("linear is a special operation");
    assert_eq!(arguments.args.len(), 3);
    assert_eq!(
        arguments.args[0],
        ArgValue::Tensor {
            shape: vec![2, 3],
            dtype: DType::F32
        }
    );

    let kernels: Vec<_> = linear
        .forward()
        .unwrap()
        .kernels()
        .iter()
        .map(|k| k.name().to_string())
        .collect();
    assert_eq!(kernels, ["transpose", "gemm", "elementwise_add"]);
    Ok(())
}

#[test]
fn packed_lstm_records_batch_sizes() -> Result<()> {
    let table = reference_table();
    let mut tracker = tracker_for(&table);
    let mut rng = StdRng::seed_from_u64(11);
    let hx = Value::List(vec![
        Tensor::zeros([1, 3, 4]).into(),
        Tensor::zeros([1, 3, 4]).into(),
    ]);
    let args = CallArgs::new()
        .with_arg(random_tensor(&mut rng, [6, 2]))
        .with_arg(Tensor::from_i32([3], vec![3, 2, 1])?)
        .with_arg(hx)
        .with_arg(random_lstm_params(&mut rng, 2, 4))
        .with_arg(true)
        .with_arg(1)
        .with_arg(0.0)
        .with_arg(false)
        .with_arg(false);

    tracker.tracked(|_| table.call("lstm", &args))?;

    let trace = tracker.get_tracked_trace();
    let arguments = trace.operations()[0].arguments().unwrap();
    assert_eq!(
        arguments.special(BATCH_SIZES_KEY),
        Some(&ArgValue::List(vec![
            ArgValue::Int(3),
            ArgValue::Int(2),
            ArgValue::Int(1)
        ]))
    );
    Ok(())
}

#[test]
fn padded_lstm_has_no_batch_sizes() -> Result<()> {
    let table = reference_table();
    let mut tracker = tracker_for(&table);
    let mut rng = StdRng::seed_from_u64(12);
    let hx = Value::List(vec![
        Tensor::zeros([1, 2, 3]).into(),
        Tensor::zeros([1, 2, 3]).into(),
    ]);
    let args = CallArgs::new()
        .with_arg(random_tensor(&mut rng, [4, 2, 5]))
        .with_arg(hx)
        .with_arg(random_lstm_params(&mut rng, 5, 3))
        .with_arg(true)
        .with_arg(1)
        .with_arg(0.0)
        .with_arg(false)
        .with_arg(false)
        .with_arg(false);

    tracker.tracked(|_| table.call("lstm", &args))?;

    let trace = tracker.get_tracked_trace();
    let arguments = trace.operations()[0].arguments().unwrap();
    assert_eq!(arguments.args.len(), 9);
    assert!(arguments.special.is_empty());
    Ok(())
}

#[test]
fn malformed_lstm_call_fails_argument_capture() -> Result<()> {
    let table = reference_table();
    let mut tracker = tracker_for(&table);
    let args = CallArgs::new()
        .with_arg(Tensor::zeros([4, 2]))
        .with_arg(Tensor::scalar(4.0));

    let scope = tracker.track()?;
    let err = table.call("lstm", &args).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<TrackingError>(),
        Some(TrackingError::ArgumentCapture { .. })
    ));
    assert!(scope.get_tracked_trace().is_empty());
    assert!(scope.is_tracking());
    scope.finish()?;
    Ok(())
}

#[test]
fn differentiable_results_get_a_backward_measurement() -> Result<()> {
    let table = reference_table();
    let mut tracker = tracker_for(&table);
    let x = Tensor::from_vec([3], vec![1.0, -1.0, 2.0])?.requires_grad(true);

    tracker.tracked(|_| table.call("relu", &CallArgs::new().with_arg(x.clone())))?;

    let trace = tracker.get_tracked_trace();
    let backward = trace.operations()[0].backward().expect("relu is differentiable");
    assert!(backward.run_time_ms() >= 0.0);
    assert!(backward
        .kernels()
        .iter()
        .any(|kernel| kernel.name() == "relu_backward"));
    Ok(())
}

#[test]
fn failing_timer_aborts_the_call_before_it_runs() -> Result<()> {
    let table = Arc::new(OpTable::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    table.register(op_fn("counted", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(Value::None)
    }));

    let mut tracker = OperationTracker::with_timer(
        Arc::clone(&table),
        Device::host(),
        quick_config(),
        Arc::new(FailingTimer),
    )?;
    let scope = tracker.track()?;
    let err = table.call("counted", &CallArgs::new()).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<TrackingError>(),
        Some(TrackingError::Measurement { .. })
    ));
    assert!(format!("{err:#}").contains("timer offline"));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(scope.get_tracked_trace().is_empty());
    drop(scope);

    table.call("counted", &CallArgs::new())?;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn stopping_restores_untracked_dispatch() -> Result<()> {
    let table = reference_table();
    let mut tracker = tracker_for(&table);

    tracker.tracked(|_| table.call("add", &CallArgs::positional([1, 1])))?;
    tracker.stop_tracking()?;
    tracker.stop_tracking()?;
    assert!(!tracker.is_tracking());

    table.call("add", &CallArgs::positional([4, 4]))?;
    assert_eq!(tracker.get_tracked_trace().len(), 1);
    Ok(())
}

#[test]
fn trace_snapshots_do_not_change_after_the_fact() -> Result<()> {
    let table = reference_table();
    let mut tracker = tracker_for(&table);
    let scope = tracker.track()?;

    table.call("add", &CallArgs::positional([1, 2]))?;
    let early = scope.get_tracked_trace();
    table.call("mul", &CallArgs::positional([3, 4]))?;
    let late = scope.get_tracked_trace();
    scope.finish()?;

    assert_eq!(early.len(), 1);
    assert_eq!(late.len(), 2);
    assert_eq!(late.operations()[0], early.operations()[0]);
    Ok(())
}

#[test]
fn reentrancy_gate_is_per_thread() -> Result<()> {
    let table = reference_table();
    let weak = Arc::downgrade(&table);
    table.register(op_fn("fan_out", move |args: &CallArgs| {
        let table = weak.upgrade().ok_or_else(|| anyhow!("table dropped"))?;
        table.call("relu", args)?;
        let remote = Arc::clone(&table);
        thread::spawn(move || remote.call("add", &CallArgs::positional([1, 2])))
            .join()
            .map_err(|_| anyhow!("worker panicked"))??;
        Ok(Value::None)
    }));
    let mut tracker = tracker_for(&table);

    tracker.tracked(|_| table.call("fan_out", &CallArgs::new().with_arg(Tensor::ones([2]))))?;

    // fan_out runs three times under the timer and once for its result before it is
    // recorded, then once for real; every run reaches add on a fresh thread.
    let names: Vec<_> = tracker
        .get_tracked_trace()
        .iter()
        .map(|op| op.name().to_string())
        .collect();
    assert_eq!(names, ["add", "add", "add", "add", "fan_out", "add"]);
    Ok(())
}

#[test]
fn mixed_special_and_plain_calls_keep_order_and_arguments() -> Result<()> {
    let table = reference_table();
    let mut tracker = tracker_for(&table);
    let mut rng = StdRng::seed_from_u64(5);
    let x = random_tensor(&mut rng, [2, 3]);
    let calls = [
        ("add", CallArgs::positional([1, 2]), false),
        (
            "matmul",
            CallArgs::new()
                .with_arg(x.clone())
                .with_arg(random_tensor(&mut rng, [3, 2])),
            true,
        ),
        ("mul", CallArgs::new().with_arg(x.clone()).with_arg(0.5), false),
        (
            "linear",
            CallArgs::new()
                .with_arg(x.clone())
                .with_arg(random_tensor(&mut rng, [4, 3]))
                .with_arg(Tensor::zeros([4])),
            true,
        ),
        ("relu", CallArgs::new().with_arg(x.clone()), false),
    ];

    tracker.tracked(|_| -> Result<()> {
        for (name, args, _) in &calls {
            table.call(name, args)?;
        }
        Ok(())
    })?;

    let trace = tracker.get_tracked_trace();
    assert_eq!(trace.len(), calls.len());
    for (op, (name, args, special)) in trace.iter().zip(&calls) {
        assert_eq!(op.name(), *name);
        if *special {
            assert_eq!(op.arguments(), Some(&Arguments::from_raw_arguments(args)));
        } else {
            assert!(op.arguments().is_none(), "{name} is not special");
        }
    }
    Ok(())
}

#[test]
fn single_special_call_is_captured_exactly() -> Result<()> {
    let table = reference_table();
    let mut tracker = tracker_for(&table);
    let args = CallArgs::new()
        .with_arg(Tensor::ones([1, 2]))
        .with_arg(Tensor::ones([2, 1]));

    tracker.tracked(|_| table.call("matmul", &args))?;

    let trace = tracker.get_tracked_trace();
    assert_eq!(trace.len(), 1);
    assert_eq!(trace.operations()[0].name(), "matmul");
    assert_eq!(
        trace.operations()[0].arguments(),
        Some(&Arguments::from_raw_arguments(&args))
    );
    Ok(())
}

#[test]
fn tracking_leaves_caller_gradients_untouched() -> Result<()> {
    let table = reference_table();
    let mut tracker =
        OperationTracker::new(Arc::clone(&table), Device::host(), TrackerConfig::default())?;
    let x = Tensor::from_vec([3], vec![1.0, -1.0, 2.0])?.requires_grad(true);

    let out = tracker.tracked(|_| table.call("relu", &CallArgs::new().with_arg(x.clone())))?;

    assert!(x.grad().is_none());
    assert!(out.as_tensor().is_some_and(|t| t.grad_fn().is_some()));
    assert!(tracker.get_tracked_trace().operations()[0].backward().is_some());
    Ok(())
}

#[test]
fn backward_covers_only_the_measured_operation() -> Result<()> {
    let table = reference_table();
    let x = Tensor::from_vec([3], vec![1.0, -1.0, 2.0])?.requires_grad(true);
    let y = table.call("relu", &CallArgs::new().with_arg(x.clone()))?;
    let mut tracker = tracker_for(&table);

    tracker.tracked(|_| table.call("sum", &CallArgs::new().with_arg(y.clone())))?;

    let trace = tracker.get_tracked_trace();
    let backward = trace.operations()[0].backward().expect("sum of relu output is differentiable");
    let kernels: Vec<_> = backward.kernels().iter().map(|k| k.name()).collect();
    assert_eq!(kernels, ["sum_backward"]);
    assert!(x.grad().is_none());
    Ok(())
}

/// Gradient function that dispatches a helper operation through the table.
struct CallsHelper {
    table: Weak<OpTable>,
}

impl GradFn for CallsHelper {
    fn name(&self) -> &str {
        "CallsHelper"
    }

    fn backward(&self, _grad_output: &Tensor) -> Result<()> {
        let table = self.table.upgrade().ok_or_else(|| anyhow!("table dropped"))?;
        table.call("helper", &CallArgs::new())?;
        Ok(())
    }
}

#[test]
fn queued_backward_does_not_record_nested_calls() -> Result<()> {
    let table = Arc::new(OpTable::new());
    let weak = Arc::downgrade(&table);
    table.register(op_fn("helper", |_| Ok(Value::None)));
    table.register(op_fn("outer", move |_| {
        let grad_fn = Arc::new(CallsHelper {
            table: weak.clone(),
        });
        Ok(Tensor::ones([2]).with_grad_fn(grad_fn).into())
    }));
    let config = TrackerConfig {
        profiler: ProfilerConfig::single_run().with_backward_mode(BackwardMode::Queued),
        ..TrackerConfig::default()
    };
    let mut tracker = OperationTracker::new(Arc::clone(&table), Device::host(), config)?;

    tracker.tracked(|_| table.call("outer", &CallArgs::new()))?;

    let trace = tracker.get_tracked_trace();
    let names: Vec<_> = trace.iter().map(|op| op.name()).collect();
    assert_eq!(names, ["outer"]);
    assert!(trace.operations()[0].backward().is_some());
    Ok(())
}
