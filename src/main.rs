use crate::config::{Config, Selector, app_name, extension_for, version};
use crate::error::CaptureError;
use crate::pipeline::{Backend, GraphSettings, LifecycleController, MediaGraph, Termination};
use crate::utils::sos::SignalOfStop;
use clap::{Arg, ArgAction, ArgMatches, Command, value_parser};
use log::{error, info};
use std::path::{Path, PathBuf};
use std::{panic, process};
use tracing_subscriber::EnvFilter;

pub mod config;
pub mod elements;
pub mod error;
pub mod pipeline;
pub mod utils;

fn command() -> Command {
    Command::new(app_name())
        .version(version())
        .author(env!("CARGO_PKG_AUTHORS"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .arg(
            Arg::new("webcam")
                .long("webcam")
                .help("Record from the local camera.")
                .action(ArgAction::SetTrue)
                .conflicts_with("rtp"),
        )
        .arg(
            Arg::new("rtp")
                .long("rtp")
                .help("Record an incoming RTP/H.264 stream.")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("JSON configuration file; flags override its values.")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("output")
                .short('o')
                .long("output")
                .value_name("PATH")
                .help("Output file, {timestamp} expands to the start time."),
        )
        .arg(
            Arg::new("duration")
                .short('d')
                .long("duration")
                .value_name("SECS")
                .help("Recording length in seconds, 0 records until interrupted.")
                .value_parser(value_parser!(u64)),
        )
        .arg(
            Arg::new("port")
                .long("port")
                .value_name("N")
                .help("UDP port of the RTP stream.")
                .value_parser(value_parser!(u16)),
        )
        .arg(
            Arg::new("payload")
                .long("payload")
                .value_name("N")
                .help("RTP payload type of the stream.")
                .value_parser(value_parser!(u8).range(0..=127)),
        )
        .arg(
            Arg::new("device")
                .long("device")
                .value_name("PATH")
                .help("Camera device node or raw frame file."),
        )
        .arg(
            Arg::new("backend")
                .long("backend")
                .value_name("NAME")
                .help("Stage library: builtin or gstreamer.")
                .value_parser(|s: &str| s.parse::<Backend>()),
        )
}

/// Fold the command line into the configuration
fn apply_flags(config: &mut Config, matches: &ArgMatches) {
    if matches.get_flag("webcam") {
        config.source = Selector::Webcam;
    } else if matches.get_flag("rtp") {
        config.source = Selector::Rtp;
    }
    if let Some(output) = matches.get_one::<String>("output") {
        config.output = output.clone();
    }
    if let Some(duration) = matches.get_one::<u64>("duration") {
        config.duration_secs = *duration;
    }
    if let Some(port) = matches.get_one::<u16>("port") {
        config.stream.port = *port;
    }
    if let Some(payload) = matches.get_one::<u8>("payload") {
        config.stream.payload = *payload;
    }
    if let Some(device) = matches.get_one::<String>("device") {
        config.device.device = Some(device.clone());
    }
    if let Some(backend) = matches.get_one::<Backend>("backend") {
        config.backend = *backend;
    }
}

async fn run_graph<G: MediaGraph>(graph: G, config: &Config, sos: SignalOfStop) -> Result<Termination, CaptureError> {
    let mut controller = LifecycleController::new(graph, config.controller_settings(), sos);
    controller.run().await
}

async fn capture(config: Config, sos: SignalOfStop) -> Result<Termination, CaptureError> {
    let Some(topology) = config.topology() else {
        return Err(CaptureError::Config("no capture source selected".into()));
    };

    let output = config.output_path(chrono::Local::now(), extension_for(config.backend));
    let location = output.to_string_lossy().to_string();
    let specs = topology.stages(config.backend, &location, &config.factories);
    info!(
        "Recording {} with the {} backend into {}",
        topology,
        config.backend,
        output.display()
    );
    let settings = GraphSettings {
        event_capacity: config.event_capacity,
        ..GraphSettings::default()
    };

    match config.backend {
        Backend::Builtin => {
            let registry = elements::Registry::with_builtins();
            let graph = pipeline::Graph::build_with(topology.name(), &specs, &registry, settings)?;
            run_graph(graph, &config, sos).await
        }
        #[cfg(feature = "gstreamer")]
        Backend::Gstreamer => {
            let graph = pipeline::gst::GstGraph::build(topology.name(), &specs, settings)?;
            run_graph(graph, &config, sos).await
        }
        #[cfg(not(feature = "gstreamer"))]
        Backend::Gstreamer => Err(CaptureError::Backend(
            "this build has no GStreamer support, rebuild with --features gstreamer".into(),
        )),
    }
}

fn load_config(path: Option<&PathBuf>, matches: &ArgMatches) -> Result<Config, CaptureError> {
    let mut config = match path {
        Some(path) => Config::load(Path::new(path))?,
        None => Config::default(),
    };
    apply_flags(&mut config, matches);
    config.validate()?;
    Ok(config)
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut cmd = command();
    let matches = match cmd.clone().try_get_matches() {
        Ok(matches) => matches,
        Err(e) => {
            let _ = e.print();
            process::exit(if e.use_stderr() { 4 } else { 0 });
        }
    };

    let config = match load_config(matches.get_one::<PathBuf>("config"), &matches) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            process::exit(e.exit_code());
        }
    };

    if config.source == Selector::None {
        let _ = cmd.print_help();
        println!();
        return;
    }

    // kill the main thread as soon as a secondary thread panics
    let orig_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        orig_hook(panic_info);
        process::exit(105);
    }));

    // first Ctrl-C finishes the recording, the second one abandons it
    let sos = SignalOfStop::new();
    let handler_sos = sos.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        handler_sos.raise();
    }) {
        error!("Error setting Ctrl-C handler: {}", e);
        process::exit(1);
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Cannot start the async runtime: {}", e);
            process::exit(1);
        }
    };

    let code = match runtime.block_on(capture(config, sos)) {
        Ok(termination) => {
            info!("Capture ended: {}", termination);
            termination.exit_code()
        }
        Err(e) => {
            error!("{}", e);
            e.exit_code()
        }
    };
    process::exit(code);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Config, CaptureError> {
        let matches = command()
            .try_get_matches_from(std::iter::once("capline").chain(args.iter().copied()))
            .map_err(|e| CaptureError::Config(e.to_string()))?;
        load_config(None, &matches)
    }

    #[test]
    fn test_flags_override_defaults() {
        let config = parse(&["--rtp", "--port", "6000", "--payload", "97", "-d", "0", "--backend", "gst"]).unwrap();
        assert_eq!(config.source, Selector::Rtp);
        assert_eq!(config.stream.port, 6000);
        assert_eq!(config.stream.payload, 97);
        assert_eq!(config.deadline(), None);
        assert_eq!(config.backend, Backend::Gstreamer);
    }

    #[test]
    fn test_no_selector_and_bad_flags() {
        assert_eq!(parse(&[]).unwrap().source, Selector::None);
        assert!(parse(&["--webcam", "--rtp"]).is_err());
        assert!(parse(&["--rtp", "--payload", "200"]).is_err());
        assert!(parse(&["--backend", "ffmpeg"]).is_err());
    }
}
