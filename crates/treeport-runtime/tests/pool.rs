use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use approx::assert_abs_diff_eq;
use treeport_backend_forest::ForestBackend;
use treeport_backend_linear::LinearBackend;
use treeport_core::{Context, IOName, Model, ModelArtifact, Shape, Tensor};
use treeport_runtime::{BatchPolicy, InferencePool, PoolConfig, PoolHandle};

const FEATURES: usize = 69;

fn artifact(name: &str) -> Result<ModelArtifact> {
    let dir = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../models").join(name);
    Ok(ModelArtifact::locate(&[dir])?)
}

fn forest_model() -> treeport_core::Result<Model> {
    let dir = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../models/forest_binary");
    let artifact = ModelArtifact::locate(&[dir])?;
    Model::load(&ForestBackend::new(), &artifact, Context::cpu())
}

fn forest_pool(workers: usize, max_rows: usize) -> Result<PoolHandle> {
    InferencePool::spawn(
        |_| forest_model(),
        PoolConfig {
            workers,
            policy: BatchPolicy {
                max_rows,
                max_delay: Duration::from_millis(20),
            },
            ..PoolConfig::default()
        },
    )
}

fn rows(n: usize, seed: usize) -> Vec<f32> {
    (0..n * FEATURES)
        .map(|i| ((i * 7 + seed * 3) % 11) as f32 / 10.0)
        .collect()
}

fn input(n: usize, values: &[f32]) -> Vec<(IOName, Tensor)> {
    let tensor = Tensor::from_slice(Shape::from_slice(&[n, FEATURES]), values);
    vec![(IOName::from("data"), tensor)]
}

fn direct(values: &[f32], margin: bool) -> Result<Vec<f32>> {
    let mut model = forest_model()?;
    let n = values.len() / FEATURES;
    model.set_pred_margin(margin);
    model.set_input("data", &[n as i64, FEATURES as i64], values)?;
    model.run()?;
    let mut out = vec![0f32; n];
    model.copy_output(0, &mut out)?;
    Ok(out)
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_requests_get_their_own_rows() -> Result<()> {
    let pool = forest_pool(1, 64)?;
    assert_eq!(pool.spec().inputs[0].name.as_str(), "data");

    let sizes = [1usize, 3, 2, 1];
    let mut tasks = Vec::new();
    for (seed, &n) in sizes.iter().enumerate() {
        let pool = pool.clone();
        let values = rows(n, seed);
        tasks.push(tokio::spawn(async move {
            let resp = pool.infer(input(n, &values), false).await?;
            anyhow::Ok((values, resp))
        }));
    }

    for (task, &n) in tasks.into_iter().zip(&sizes) {
        let (values, resp) = task.await??;
        assert_eq!(resp.outputs.len(), 1);
        let (name, tensor) = &resp.outputs[0];
        assert_eq!(name.as_str(), "predictions");
        assert_eq!(tensor.shape, Shape::from_slice(&[n, 1]));
        assert!(resp.timings.batch_rows >= n);

        let expected = direct(&values, false)?;
        for (got, want) in tensor.to_vec::<f32>()?.iter().zip(&expected) {
            assert_abs_diff_eq!(*got, *want, epsilon = 1e-6);
        }
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn margin_and_transformed_requests_do_not_mix() -> Result<()> {
    let pool = forest_pool(2, 64)?;
    let values = rows(2, 5);

    let (prob, margin) = tokio::join!(
        pool.infer(input(2, &values), false),
        pool.infer(input(2, &values), true),
    );
    let prob = prob?.outputs[0].1.to_vec::<f32>()?;
    let margin = margin?.outputs[0].1.to_vec::<f32>()?;

    for (p, m) in prob.iter().zip(&margin) {
        assert_abs_diff_eq!(*p, 1.0 / (1.0 + (-m).exp()), epsilon = 1e-6);
    }
    assert_eq!(margin, direct(&values, true)?);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn bad_request_fails_alone() -> Result<()> {
    let pool = forest_pool(1, 64)?;
    let good = rows(1, 0);
    let bad = Tensor::from_slice(Shape::from_slice(&[1, 3]), &[0f32; 3]);

    let (good_resp, bad_resp) = tokio::join!(
        pool.infer(input(1, &good), false),
        pool.infer(vec![(IOName::from("data"), bad)], false),
    );
    assert_eq!(good_resp?.outputs[0].1.shape, Shape::from_slice(&[1, 1]));
    let err = bad_resp.err().expect("wrong feature count must fail");
    assert!(format!("{err:#}").contains("data"));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn malformed_tensor_is_rejected_before_queueing() -> Result<()> {
    let pool = forest_pool(1, 64)?;
    let short = Tensor::from_cpu_bytes(
        treeport_core::DType::F32,
        Shape::from_slice(&[2, FEATURES]),
        bytes_of(FEATURES),
    );
    assert!(pool
        .infer(vec![(IOName::from("data"), short)], false)
        .await
        .is_err());

    let overflowing = Tensor::from_cpu_bytes(
        treeport_core::DType::F32,
        Shape::from_slice(&[usize::MAX, FEATURES]),
        bytes_of(FEATURES),
    );
    let err = pool
        .infer(vec![(IOName::from("data"), overflowing)], false)
        .await
        .err()
        .expect("overflowing shape must be rejected");
    assert!(err.to_string().contains("too large"));

    // The pool keeps serving after rejecting both.
    let values = rows(1, 1);
    assert!(pool.infer(input(1, &values), false).await.is_ok());
    Ok(())
}

fn bytes_of(values: usize) -> bytes::Bytes {
    bytes::Bytes::from(vec![0u8; values * 4])
}

#[tokio::test(flavor = "multi_thread")]
async fn oversized_request_runs_as_its_own_batch() -> Result<()> {
    let pool = forest_pool(1, 4)?;
    let values = rows(9, 2);
    let resp = pool.infer(input(9, &values), true).await?;
    assert_eq!(resp.timings.batch_rows, 9);
    assert_eq!(resp.outputs[0].1.to_vec::<f32>()?, direct(&values, true)?);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn linear_pool_across_workers() -> Result<()> {
    let artifact = artifact("linear_regression")?;
    let pool = InferencePool::spawn(
        |_| Model::load(&LinearBackend::new(), &artifact, Context::cpu()),
        PoolConfig {
            workers: 3,
            ..PoolConfig::default()
        },
    )?;

    let mut tasks = Vec::new();
    for i in 0..12 {
        let pool = pool.clone();
        tasks.push(tokio::spawn(async move {
            let x = i as f32;
            let tensor = Tensor::from_slice(Shape::from_slice(&[1, 3]), &[x, 0.0, 1.0]);
            let resp = pool.infer(vec![(IOName::from("data"), tensor)], false).await?;
            anyhow::Ok((x, resp.outputs[0].1.to_vec::<f32>()?))
        }));
    }
    for task in tasks {
        let (x, out) = task.await??;
        assert_abs_diff_eq!(out[0], 0.5 * x + 2.0 + 0.75, epsilon = 1e-5);
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn pool_needs_a_worker() {
    let config = PoolConfig {
        workers: 0,
        ..PoolConfig::default()
    };
    assert!(InferencePool::spawn(|_| forest_model(), config).is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn labelled_outputs_are_never_merged() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let ensemble = r#"{
        "num_feature": 1,
        "trees": [ { "nodes": [
            { "split_feature_id": 0, "threshold": 0.5, "left_child": 1, "right_child": 2 },
            { "leaf_value": 0.0 }, { "leaf_value": 1.0 } ] } ],
        "data_transform": {
            "output": { "0": { "categorical_string": { "0": "low", "1": "high" } } }
        }
    }"#;
    std::fs::write(dir.path().join("labelled.json"), ensemble)?;
    let artifact = ModelArtifact::locate(&[dir.path()])?;

    let pool = InferencePool::spawn(
        |_| Model::load(&ForestBackend::new(), &artifact, Context::cpu()),
        PoolConfig {
            workers: 1,
            policy: BatchPolicy {
                max_rows: 64,
                max_delay: Duration::from_millis(20),
            },
            ..PoolConfig::default()
        },
    )?;

    let mut tasks = Vec::new();
    for value in [0.0f32, 1.0, 0.2] {
        let pool = pool.clone();
        tasks.push(tokio::spawn(async move {
            let tensor = Tensor::from_slice(Shape::from_slice(&[1, 1]), &[value]);
            pool.infer(vec![(IOName::from("data"), tensor)], false).await
        }));
    }

    let mut labels = Vec::new();
    for task in tasks {
        let resp = task.await??;
        assert_eq!(resp.timings.batch_rows, 1);
        labels.push(String::from_utf8(resp.outputs[0].1.data.to_vec())?);
    }
    assert_eq!(labels, [r#"[["low"]]"#, r#"[["high"]]"#, r#"[["low"]]"#]);
    Ok(())
}
