use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Result, bail};
use tracing::{info, warn};

use firmcarve::engine::Engine;
use firmcarve::tool::SystemToolRunner;
use firmcarve::{cli, config, logging, metadata, pipeline, util};

fn main() -> Result<()> {
    logging::init_logging();

    let cli_opts = cli::parse();
    util::apply_resource_limits(cli_opts.max_memory_mib, cli_opts.max_open_files)?;

    let loaded = config::load_config(cli_opts.config_path.as_deref())?;
    let mut cfg = loaded.config;
    if let Some(secs) = cli_opts.tool_timeout_secs {
        cfg.tool_timeout_secs = secs;
    }
    cfg.apply_overrides(&cli_opts.set)?;
    let unknown_formats = util::filter_drivers(&mut cfg, cli_opts.formats.as_deref());
    for unknown in unknown_formats {
        warn!("unknown format in --formats: {unknown}");
    }
    if cfg.drivers.is_empty() {
        bail!("no formats enabled");
    }

    util::ensure_output_dir(&cli_opts.output)?;
    let run_output_dir = cli_opts.output.join(&cfg.run_id);
    std::fs::create_dir_all(&run_output_dir)?;

    info!(
        "starting run_id={} input={} output={} workers={} tool_timeout_secs={}",
        cfg.run_id,
        cli_opts.input.display(),
        run_output_dir.display(),
        cli_opts.workers,
        cfg.tool_timeout_secs
    );

    let cancel = Arc::new(AtomicBool::new(false));
    let handler_flag = cancel.clone();
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::SeqCst);
    })?;

    let runner = Arc::new(SystemToolRunner::new(cancel.clone()));
    let engine = Arc::new(Engine::new(&cfg, runner, cancel.clone())?);
    if engine.registry().is_empty() {
        bail!("no drivers left after applying configuration");
    }

    let meta_sink = metadata::build_sink(
        &cfg.run_id,
        env!("CARGO_PKG_VERSION"),
        &loaded.config_hash,
        &run_output_dir,
    )?;

    let stats = pipeline::run_pipeline(
        &cfg,
        &cli_opts.input,
        &run_output_dir,
        engine,
        meta_sink,
        cli_opts.workers,
        cancel,
    )?;

    info!(
        "firmcarve run finished; output in {}",
        stats.unpack_root.display()
    );
    if stats.cancelled {
        bail!("run interrupted");
    }
    Ok(())
}
