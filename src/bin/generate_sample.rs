use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use digit_model_export::config::ExportConfig;
use digit_model_export::data::model::NumericArray;
use digit_model_export::pickle::writer;
use digit_model_export::value::{ClassPath, Object, Value};
use ndarray::{ArrayD, IxDyn};

const IMAGE_PIXELS: usize = 28 * 28;
const PCA_COMPONENTS: usize = 17;

/// Minimal deterministic PRNG (xoshiro256**)
struct SimpleRng {
    state: [u64; 4],
}

impl SimpleRng {
    fn new(seed: u64) -> Self {
        let mut s = [0u64; 4];
        let mut x = seed;
        for slot in &mut s {
            x = x.wrapping_mul(6364136223846793005).wrapping_add(1);
            *slot = x;
        }
        SimpleRng { state: s }
    }

    fn next_u64(&mut self) -> u64 {
        let result = (self.state[1].wrapping_mul(5))
            .rotate_left(7)
            .wrapping_mul(9);
        let t = self.state[1] << 17;
        self.state[2] ^= self.state[0];
        self.state[3] ^= self.state[1];
        self.state[1] ^= self.state[2];
        self.state[0] ^= self.state[3];
        self.state[2] ^= t;
        self.state[3] = self.state[3].rotate_left(45);
        result
    }

    fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    /// Box-Muller transform for normal distribution
    fn gauss(&mut self, mean: f64, std_dev: f64) -> f64 {
        let u1 = self.next_f64().max(1e-15);
        let u2 = self.next_f64();
        let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
        mean + std_dev * z
    }
}

fn key(name: &str) -> Value {
    Value::String(name.to_string())
}

fn random_array(rng: &mut SimpleRng, shape: &[usize], std_dev: f64) -> Result<Value> {
    let len: usize = shape.iter().product();
    let data = (0..len).map(|_| rng.gauss(0.0, std_dev)).collect();
    let array = ArrayD::from_shape_vec(IxDyn(shape), data).context("building sample array")?;
    Ok(Value::Array(NumericArray::Float(array)))
}

/// `{digit: {alpha, beta, n_components, degree_n, degree_d}}` for digits 0–9.
fn classifier_models(rng: &mut SimpleRng) -> Result<Value> {
    let mut models = Vec::new();
    for digit in 0..10i64 {
        let n_components = 3 + digit % 4;
        let degree_n = 2 + digit % 2;
        let degree_d = 1 + digit % 3;
        let rows = n_components as usize;
        let bundle = Value::Dict(vec![
            (key("alpha"), random_array(rng, &[rows, degree_n as usize + 1], 1.0)?),
            (key("beta"), random_array(rng, &[rows, degree_d as usize], 0.5)?),
            (key("n_components"), Value::Int(n_components)),
            (key("degree_n"), Value::Int(degree_n)),
            (key("degree_d"), Value::Int(degree_d)),
        ]);
        models.push((Value::Int(digit), bundle));
    }
    Ok(Value::Dict(models))
}

/// A fitted `PCA` instance as scikit-learn pickles it.
fn projection_model(rng: &mut SimpleRng) -> Result<Value> {
    let mut ratios: Vec<f64> = (0..PCA_COMPONENTS)
        .map(|i| (-(i as f64) / 6.0).exp() * (1.0 + 0.05 * rng.next_f64()))
        .collect();
    ratios.sort_by(|a, b| b.total_cmp(a));
    let total: f64 = ratios.iter().sum::<f64>() / 0.8;
    let ratios = ArrayD::from_shape_vec(
        IxDyn(&[PCA_COMPONENTS]),
        ratios.into_iter().map(|r| r / total).collect(),
    )
    .context("building variance ratios")?;

    let mean: Vec<f64> = (0..IMAGE_PIXELS)
        .map(|_| rng.gauss(0.13, 0.1).clamp(0.0, 1.0))
        .collect();
    let mean = ArrayD::from_shape_vec(IxDyn(&[IMAGE_PIXELS]), mean).context("building mean")?;

    let state = Value::Dict(vec![
        (key("n_components"), Value::Int(PCA_COMPONENTS as i64)),
        (key("copy"), Value::Bool(true)),
        (key("whiten"), Value::Bool(false)),
        (key("svd_solver"), key("auto")),
        (key("n_features_in_"), Value::Int(IMAGE_PIXELS as i64)),
        (key("n_samples_"), Value::Int(60000)),
        (key("mean_"), Value::Array(NumericArray::Float(mean))),
        (
            key("components_"),
            random_array(rng, &[PCA_COMPONENTS, IMAGE_PIXELS], 0.036)?,
        ),
        (key("n_components_"), Value::Int(PCA_COMPONENTS as i64)),
        (
            key("explained_variance_ratio_"),
            Value::Array(NumericArray::Float(ratios)),
        ),
    ]);

    Ok(Value::Object(Object {
        class: ClassPath::new("sklearn.decomposition._pca", "PCA"),
        args: Vec::new(),
        state: Some(Box::new(state)),
    }))
}

fn write_pickle(path: &Path, value: &Value) -> Result<usize> {
    let bytes = writer::to_vec(value).with_context(|| format!("pickling {}", path.display()))?;
    fs::write(path, &bytes).with_context(|| format!("writing {}", path.display()))?;
    Ok(bytes.len())
}

fn main() -> Result<()> {
    let mut rng = SimpleRng::new(42);
    let config = ExportConfig::default();
    fs::create_dir_all(config.model_dir())
        .with_context(|| format!("creating {}", config.model_dir().display()))?;

    let rfc_path = config.classifier_input();
    let rfc_bytes = write_pickle(&rfc_path, &classifier_models(&mut rng)?)?;
    println!("Wrote 10 digit models to {} ({rfc_bytes} bytes)", rfc_path.display());

    let pca_path = config.projection_input();
    let pca_bytes = write_pickle(&pca_path, &projection_model(&mut rng)?)?;
    println!(
        "Wrote PCA ({PCA_COMPONENTS}×{IMAGE_PIXELS}) to {} ({pca_bytes} bytes)",
        pca_path.display()
    );
    Ok(())
}
