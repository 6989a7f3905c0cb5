mod cli;
mod rows;

use std::io::Write;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use cli::{BackendKind, Cli, Command, ModelArgs};
use treeport_backend_forest::ForestBackend;
use treeport_backend_linear::LinearBackend;
use treeport_core::{DType, Model, ModelArtifact, Shape, Tensor};
use treeport_runtime::{BatchPolicy, InferencePool, PoolConfig};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log);

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    match cli.command {
        Command::Inspect { model } => {
            let model = load_model(&model)?;
            for line in describe(&model)? {
                writeln!(out, "{line}")?;
            }
            Ok(())
        }
        Command::Predict {
            model,
            input,
            margin,
            workers,
            max_batch,
            max_delay_ms,
        } => {
            let config = PoolConfig {
                workers,
                policy: BatchPolicy {
                    max_rows: max_batch,
                    max_delay: Duration::from_millis(max_delay_ms),
                },
                ..PoolConfig::default()
            };
            predict(&model, &input, margin, config, &mut out).await
        }
    }
}

fn init_tracing(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_model(args: &ModelArgs) -> Result<Model> {
    let context = args
        .device
        .parse()
        .with_context(|| format!("invalid --device `{}`", args.device))?;
    let artifact = ModelArtifact::locate(args.paths.as_slice()).context("locating model files")?;
    let model = match args.backend {
        BackendKind::Forest => Model::load(&ForestBackend::new(), &artifact, context),
        BackendKind::Linear => Model::load(&LinearBackend::new(), &artifact, context),
    };
    model.with_context(|| format!("loading {:?} model", args.backend))
}

fn describe(model: &Model) -> Result<Vec<String>> {
    let caps = model.capabilities();
    let mut lines = vec![format!(
        "backend {} (input readback: {}, dynamic batch: {})",
        model.backend_name(),
        caps.supports_input_readback,
        caps.supports_dynamic_batch
    )];
    for i in 0..model.num_inputs() {
        lines.push(format!(
            "input  {i} {} {} {:?}",
            model.input_name(i)?,
            model.input_type(i)?,
            model.input_shape(i)?
        ));
    }
    for slot in 0..model.num_outputs() {
        lines.push(format!(
            "output {slot} {} {} {:?}",
            model.output_name(slot)?,
            model.output_type(slot)?,
            model.output_shape(slot)?
        ));
    }
    Ok(lines)
}

async fn predict(
    args: &ModelArgs,
    input: &Path,
    margin: bool,
    config: PoolConfig,
    out: &mut impl Write,
) -> Result<()> {
    let file = std::fs::File::open(input)
        .with_context(|| format!("opening {}", input.display()))?;

    let pool = InferencePool::spawn(|_| load_model(args), config)?;
    let spec = pool.spec();
    let [feature_input] = spec.inputs.as_slice() else {
        bail!("predict needs a model with exactly one input");
    };
    let Some(num_feature) = feature_input.dims.get(1).and_then(|d| d.known()) else {
        bail!("input `{}` has no fixed feature axis", feature_input.name);
    };
    let name = feature_input.name.clone();

    let values = rows::parse_rows(file, num_feature)
        .with_context(|| format!("reading {}", input.display()))?;
    tracing::info!(rows = values.len() / num_feature, margin, "scoring");

    let mut pending = Vec::new();
    for row in values.chunks_exact(num_feature) {
        let pool = pool.clone();
        let tensor = Tensor::from_slice(Shape::from_slice(&[1, num_feature]), row);
        let inputs = vec![(name.clone(), tensor)];
        pending.push(tokio::spawn(async move { pool.infer(inputs, margin).await }));
    }

    for (row, handle) in pending.into_iter().enumerate() {
        let resp = handle
            .await?
            .with_context(|| format!("scoring row {}", row + 1))?;
        let (_, tensor) = resp
            .outputs
            .first()
            .context("model produced no outputs")?;
        match tensor.dtype {
            // Label text from an output transform.
            DType::U8 => writeln!(out, "{}", std::str::from_utf8(&tensor.data)?)?,
            _ => writeln!(out, "{}", rows::format_row(&tensor.to_vec::<f32>()?))?,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn linear_args(dir: &Path) -> ModelArgs {
        ModelArgs {
            backend: BackendKind::Linear,
            device: "cpu".to_string(),
            paths: vec![dir.to_path_buf()],
        }
    }

    fn fixture(name: &str) -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("../../models")
            .join(name)
    }

    #[test]
    fn describe_lists_unbound_shapes() -> Result<()> {
        let model = load_model(&ModelArgs {
            backend: BackendKind::Forest,
            device: "cpu:0".to_string(),
            paths: vec![fixture("forest_binary")],
        })?;
        let lines = describe(&model)?;
        assert_eq!(lines[1], "input  0 data float32 [-1, 69]");
        assert_eq!(lines[2], "output 0 predictions float32 [-1, 1]");
        Ok(())
    }

    #[test]
    fn bad_device_is_reported() {
        let mut args = linear_args(&fixture("linear_regression"));
        args.device = "tpu:0".to_string();
        let err = load_model(&args).err().expect("tpu is not a device");
        assert!(format!("{err:#}").contains("--device"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn predict_writes_one_line_per_row() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let csv = dir.path().join("rows.csv");
        std::fs::write(&csv, "1,0,0\n0,0,1\n,,\n")?;

        let mut out = Vec::new();
        predict(
            &linear_args(&fixture("linear_regression")),
            &csv,
            false,
            PoolConfig::default(),
            &mut out,
        )
        .await?;

        let text = String::from_utf8(out)?;
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines, vec!["1.25", "2.75", "0.75"]);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn predict_prints_label_text() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let model_dir = dir.path().join("model");
        std::fs::create_dir(&model_dir)?;
        std::fs::write(
            model_dir.join("labelled.json"),
            r#"{
                "num_feature": 1,
                "trees": [ { "nodes": [
                    { "split_feature_id": 0, "threshold": 0.5, "left_child": 1, "right_child": 2 },
                    { "leaf_value": 0.0 }, { "leaf_value": 1.0 } ] } ],
                "data_transform": {
                    "output": { "0": { "categorical_string": { "1": "yes" } } }
                }
            }"#,
        )?;
        let csv = dir.path().join("rows.csv");
        std::fs::write(&csv, "0.9\n0.1\n")?;

        let args = ModelArgs {
            backend: BackendKind::Forest,
            device: "cpu".to_string(),
            paths: vec![model_dir],
        };
        let mut out = Vec::new();
        predict(&args, &csv, false, PoolConfig::default(), &mut out).await?;

        let text = String::from_utf8(out)?;
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines, vec![r#"[["yes"]]"#, r#"[["<unseen_label>"]]"#]);
        Ok(())
    }
}
