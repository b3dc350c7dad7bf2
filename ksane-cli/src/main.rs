mod config;
mod pnm;

use anyhow::{anyhow, bail, Context};
use argh::FromArgs;
use config::Config;
use ksane::{
    libsane::{Backend, SaneError},
    names::INVERT_COLORS,
    DeviceDiscovery, ScanKind, ScanStatus, ScannedImage, Session, SessionEvent,
};
use log::Level;
use std::{
    collections::BTreeMap,
    path::PathBuf,
    process,
    sync::Arc,
    thread,
    time::Duration,
};
use tokio::sync::mpsc::UnboundedReceiver;

const EVENT_POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(FromArgs)]
/// Scanner front end: list devices, show options, preview and scan
struct Args {
    /// path to config
    #[argh(option)]
    config: Option<PathBuf>,

    /// enable extra logs
    #[argh(switch)]
    verbose: bool,

    #[argh(subcommand)]
    command: Command,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Command {
    List(ListArgs),
    Options(OptionsArgs),
    Preview(PreviewArgs),
    Scan(ScanArgs),
}

#[derive(FromArgs)]
/// List available devices
#[argh(subcommand, name = "list")]
struct ListArgs {}

#[derive(FromArgs)]
/// Show the options of a device
#[argh(subcommand, name = "options")]
struct OptionsArgs {
    /// device name
    #[argh(option)]
    device: Option<String>,
}

#[derive(FromArgs)]
/// Take a low resolution preview of the whole scan area
#[argh(subcommand, name = "preview")]
struct PreviewArgs {
    /// device name
    #[argh(option)]
    device: Option<String>,

    /// option value as name=value, may be repeated
    #[argh(option)]
    set: Vec<String>,

    /// preview resolution in dpi
    #[argh(option)]
    dpi: Option<f64>,

    /// output file
    #[argh(option, default = "PathBuf::from(\"preview.ppm\")")]
    output: PathBuf,
}

#[derive(FromArgs)]
/// Scan the scan area, a list of regions or every page in the feeder
#[argh(subcommand, name = "scan")]
struct ScanArgs {
    /// device name
    #[argh(option)]
    device: Option<String>,

    /// option value as name=value, may be repeated
    #[argh(option)]
    set: Vec<String>,

    /// region in millimetres as tl_x,tl_y,br_x,br_y, may be repeated
    #[argh(option)]
    selection: Vec<String>,

    /// output file name prefix
    #[argh(option)]
    output: Option<String>,
}

#[tokio::main]
async fn main() {
    let args: Args = argh::from_env();

    simple_logger::init_with_level(if args.verbose {
        Level::Trace
    } else {
        Level::Info
    })
    .unwrap();

    hello(&args);

    let config = match &args.config {
        Some(path) => match Config::read_from(path) {
            Ok(config) => config,
            Err(err) => {
                log::error!("Failed to read config: {err:#}");
                process::exit(1);
            }
        },
        None => Config::default(),
    };

    if args.verbose {
        log::debug!("Use config {config:#?}");
    }

    let result = match args.command {
        Command::List(_) => list().await,
        Command::Options(options) => show_options(config, options).await,
        Command::Preview(preview) => run_preview(config, preview).await,
        Command::Scan(scan) => run_scan(config, scan).await,
    };

    if let Err(err) = result {
        log::error!("{err:#}");
        process::exit(1);
    }
}

fn hello(args: &Args) {
    log::info!(
        "{bin} version {version}, commit {commit}, config from {config_path}, verbose {verbose}",
        bin = env!("CARGO_PKG_NAME"),
        version = env!("CARGO_PKG_VERSION"),
        commit = env!("GIT_COMMIT_HASH"),
        config_path = args
            .config
            .as_ref()
            .map_or("(none)".into(), |path| path.display().to_string()),
        verbose = if args.verbose { "on" } else { "off" },
    );
}

#[cfg(feature = "sane")]
fn backend() -> anyhow::Result<Arc<dyn Backend>> {
    let backend = libsane::SaneBackend::new().context("initializing SANE")?;
    Ok(Arc::new(backend))
}

#[cfg(not(feature = "sane"))]
fn backend() -> anyhow::Result<Arc<dyn Backend>> {
    log::info!("Built without SANE support, only the test device is available");
    Ok(Arc::new(libsane::TestBackend::new()))
}

async fn list() -> anyhow::Result<()> {
    let discovery = DeviceDiscovery::new(backend()?)?;
    let devices = tokio::task::spawn_blocking(move || discovery.wait()).await?;

    if devices.is_empty() {
        log::info!("No devices found");
    }
    for device in devices {
        println!("{device}");
    }

    Ok(())
}

type Opened = (Session, UnboundedReceiver<SessionEvent>);

async fn open(config: Config, device: Option<String>) -> anyhow::Result<Opened> {
    tokio::task::spawn_blocking(move || {
        let backend = backend()?;
        let discovery = DeviceDiscovery::new(backend.clone())?;

        let name = match device.or(config.devices.scanner.clone()) {
            Some(name) => name,
            None => discovery
                .select_device(|devices| {
                    log::error!("Several devices found, pick one with --device:");
                    for device in devices {
                        log::error!("  {device}");
                    }
                    None
                })
                .context("no scanner to use")?,
        };

        let (mut session, events) = Session::new(backend, discovery, config.session_for(&name));
        session.listen_user_messages(true);
        session
            .open(&name)
            .with_context(|| format!("opening device '{name}'"))?;

        Ok((session, events))
    })
    .await?
}

async fn show_options(config: Config, args: OptionsArgs) -> anyhow::Result<()> {
    let (mut session, _events) = open(config, args.device).await?;

    let mut group = None;
    for option in session.options().filter(|option| option.has_gui()) {
        if option.group() != group {
            group = option.group();
            println!("{}:", group.unwrap_or("(no group)"));
        }

        let value = option
            .display_value()
            .unwrap_or_else(|err| format!("({err})"));
        println!(
            "  {name} = {value} [{kind:?}, {state:?}] {title}",
            name = option.name(),
            kind = option.kind(),
            state = option.state(),
            title = option.title(),
        );

        let entries = option.display_entries();
        if !entries.is_empty() {
            println!("      one of: {}", entries.join(", "));
        }
    }

    session.close();

    Ok(())
}

async fn run_preview(config: Config, args: PreviewArgs) -> anyhow::Result<()> {
    let (mut session, events) = open(config, args.device).await?;

    apply_settings(&mut session, &args.set)?;
    if let Some(dpi) = args.dpi {
        session.set_preview_resolution(dpi);
    }

    session.start_preview()?;
    let (session, images) = wait_for_scan(session, events).await?;

    let preview = images
        .into_iter()
        .find(|image| image.kind == ScanKind::Preview)
        .context("device delivered no preview")?;
    let raster = session.to_raster(&preview)?;
    pnm::write_ppm(&args.output, &raster)?;

    log::info!("Preview written to {}", args.output.display());

    Ok(())
}

async fn run_scan(config: Config, args: ScanArgs) -> anyhow::Result<()> {
    let prefix = args
        .output
        .clone()
        .unwrap_or_else(|| config.output.prefix.clone());
    let (mut session, events) = open(config, args.device).await?;

    apply_settings(&mut session, &args.set)?;

    for text in &args.selection {
        let [tl_x, tl_y, br_x, br_y] = parse_selection(text)?;
        let selection = session
            .selection_from_mm(tl_x, tl_y, br_x, br_y)
            .context("device has no scan area")?;
        session.add_selection(selection);
    }

    session.start_final()?;
    let (session, images) = wait_for_scan(session, events).await?;

    if images.is_empty() {
        log::warn!("Nothing was scanned");
    }

    for (n, image) in images.iter().enumerate() {
        let path = PathBuf::from(format!("{prefix}-{n}.ppm", n = n + 1));
        let raster = session.to_raster(image)?;
        pnm::write_ppm(&path, &raster)?;
        log::info!(
            "Page {n} ({width}x{height}, {format}) written to {path}",
            n = n + 1,
            width = image.width,
            height = image.height,
            format = image.format,
            path = path.display(),
        );
    }

    Ok(())
}

fn apply_settings(session: &mut Session, settings: &[String]) -> anyhow::Result<()> {
    let mut values = BTreeMap::new();
    for setting in settings {
        let (name, value) = setting
            .split_once('=')
            .with_context(|| format!("'{setting}' is not name=value"))?;
        let name = name.trim();

        if name != INVERT_COLORS && session.option(name).is_none() {
            bail!("device has no option '{name}'");
        }
        values.insert(name.to_owned(), value.trim().to_owned());
    }

    if values.is_empty() {
        return Ok(());
    }

    let failed = session.set_option_values(&values)?;
    if failed > 0 {
        bail!("device refused {failed} of {} option values", values.len());
    }

    Ok(())
}

fn parse_selection(text: &str) -> anyhow::Result<[f64; 4]> {
    let values = text
        .split(',')
        .map(|value| value.trim().parse::<f64>())
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("parsing selection '{text}'"))?;

    values
        .try_into()
        .map_err(|_| anyhow!("selection '{text}' needs four values"))
}

/// Drives the session until the scan ends. Ctrl-C cancels it.
async fn wait_for_scan(
    session: Session,
    events: UnboundedReceiver<SessionEvent>,
) -> anyhow::Result<(Session, Vec<ScannedImage>)> {
    let canceller = session.canceller();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Cancel scan");
            canceller.cancel();
        }
    });

    let result = tokio::task::spawn_blocking(move || drive(session, events)).await;
    ctrl_c.abort();

    let (mut session, images) = result??;
    session.close();

    Ok((session, images))
}

fn drive(
    mut session: Session,
    mut events: UnboundedReceiver<SessionEvent>,
) -> anyhow::Result<(Session, Vec<ScannedImage>)> {
    let mut images = Vec::new();

    loop {
        session.poll();

        while let Ok(event) = events.try_recv() {
            match event {
                SessionEvent::Progress(progress) => log::info!("Progress {progress}%"),
                SessionEvent::ImageReady(image) => {
                    log::debug!("Got {} image {}x{}", image.kind, image.width, image.height);
                    images.push(image);
                }
                SessionEvent::UserMessage { status, message } => match status {
                    ScanStatus::ErrorGeneral => log::error!("{message}"),
                    _ => log::info!("{message}"),
                },
                SessionEvent::ButtonPressed { name, pressed, .. } => {
                    log::debug!("Button '{name}' pressed: {pressed}");
                }
                SessionEvent::OptionValueChanged { name, value } => {
                    log::debug!("Option '{name}' is now '{value}'");
                }
                SessionEvent::DeviceListUpdated(_) => {}
                SessionEvent::ScanDone {
                    status,
                    reason,
                    message,
                } => {
                    return match (status, reason) {
                        (ScanStatus::ErrorGeneral, _) => Err(anyhow!("scan failed: {message}")),
                        (_, Some(SaneError::Cancelled)) => {
                            log::info!("Scan cancelled");
                            Ok((session, images))
                        }
                        _ => Ok((session, images)),
                    };
                }
            }
        }

        thread::sleep(EVENT_POLL_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selections_need_four_numbers() {
        assert_eq!(parse_selection("0, 0,100,50.5").unwrap(), [0.0, 0.0, 100.0, 50.5]);
        assert!(parse_selection("0,0,100").is_err());
        assert!(parse_selection("a,b,c,d").is_err());
    }
}
