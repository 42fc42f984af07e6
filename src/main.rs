use digit_model_export::config::ExportConfig;
use digit_model_export::export;

fn main() -> anyhow::Result<()> {
    env_logger::init();

    export::run(&ExportConfig::default())?;
    Ok(())
}
