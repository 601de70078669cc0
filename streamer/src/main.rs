use log::{error, info, warn};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use streaming::{
    BackendKind, DeviceBuffer, SoftDevice, StreamFile, StreamingConfig, StreamingContext,
    TransferRequest,
};
use structopt::StructOpt;

#[derive(StructOpt, Debug)]
#[structopt(name = "streamer")]
pub struct StreamerParameters {
    /// Files to stream into device buffers.
    #[structopt(short, long, parse(from_os_str), required = true)]
    input: Vec<PathBuf>,

    /// JSON file with streaming settings.
    #[structopt(short, long, parse(from_os_str))]
    config: Option<PathBuf>,

    #[structopt(short, long, parse(try_from_str = parse_backend))]
    backend: Option<BackendKind>,

    /// Maximum number of frames in flight.
    #[structopt(short = "d", long)]
    max_delay: Option<u64>,

    /// Compares every buffer with the file it was loaded from.
    #[structopt(short, long)]
    verify: bool,
}

fn parse_backend(src: &str) -> Result<BackendKind, &'static str> {
    match src.to_lowercase().as_str() {
        "direct" => Ok(BackendKind::Direct),
        "fallback" => Ok(BackendKind::Fallback),
        _ => Err("unknown backend"),
    }
}

fn load_config(params: &StreamerParameters) -> StreamingConfig {
    let loaded = match &params.config {
        Some(path) => StreamingConfig::load(path),
        None => StreamingConfig::from_env(),
    };
    let mut config = match loaded {
        Ok(t) => t,
        Err(e) => {
            error!("Cannot load streaming settings: {}", e);
            std::process::exit(2);
        }
    };

    if let Some(backend) = params.backend {
        config.backend = backend;
    }
    if let Some(max_delay) = params.max_delay {
        config.max_delay_frames = max_delay;
    }
    config
}

fn main() {
    // initialize logging at start of the application
    simple_logger::init().unwrap();

    let params = StreamerParameters::from_args();
    let config = load_config(&params);
    let mut ctx = match StreamingContext::new(config, SoftDevice::new()) {
        Ok(t) => t,
        Err(e) => {
            error!("Invalid streaming settings: {}", e);
            std::process::exit(2);
        }
    };

    let start = Instant::now();
    let mut loads = Vec::with_capacity(params.input.len());
    for path in params.input.iter() {
        let file = match StreamFile::open(path) {
            Ok(t) => t,
            Err(e) => {
                error!("Cannot open {:?}: {}", path, e);
                continue;
            }
        };
        if file.is_empty() {
            warn!("Skipping empty file {:?}", path);
            continue;
        }

        let buffer = DeviceBuffer::new(path.to_string_lossy(), file.len() as usize);
        let ticket = {
            let buffer = buffer.clone();
            ctx.load(move |args| {
                args.disk
                    .push(TransferRequest::file_to_buffer(&file, 0, &buffer, 0, file.len()));
                args.disk.own_file(file);
            })
        };
        ctx.wake();
        loads.push((path, buffer, ticket));
    }

    let mut failed = false;
    let mut bytes = 0;
    for (path, buffer, ticket) in loads.iter() {
        // housekeeping may be disabled in the settings
        while !ticket.is_loaded() && ctx.failure().is_none() {
            ctx.poll();
            std::thread::sleep(Duration::from_millis(1));
        }
        if let Err(e) = ticket.wait() {
            error!("Streaming of {:?} failed: {}", path, e);
            failed = true;
            break;
        }

        info!("Loaded {:?} ({} bytes)", path, buffer.len());
        bytes += buffer.len();

        if params.verify {
            match std::fs::read(path) {
                Ok(data) if data == buffer.contents() => {}
                Ok(_) => {
                    error!("Contents of {:?} do not match the device buffer", path);
                    failed = true;
                }
                Err(e) => warn!("Cannot verify {:?}: {}", path, e),
            }
        }
    }
    let elapsed = start.elapsed();
    ctx.shutdown();

    let stats = ctx.stats();
    println!("files={}", loads.len());
    println!("bytes={}", bytes);
    println!("total={}ms", elapsed.as_millis());
    println!("frames={}", ctx.finished_frame());
    println!("slot_wait={}ms", stats.slot_wait.total_time().as_millis());
    println!("build={}ms", stats.build.total_time().as_millis());
    println!("submit={}ms", stats.submit.total_time().as_millis());

    if failed {
        std::process::exit(1);
    }
}
