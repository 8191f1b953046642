//! A CLI tool for decoding the frames of a DICOM file
//! into the raw raster cache.
use clap::Parser;
use dicom_pixelcore::window::{WindowCalculator, WindowOverrides};
use dicom_pixelcore::{DecoderContext, PixelSource, RawCache, ReadParams};
use snafu::{Report, ResultExt, Whatever};
use std::ops::RangeInclusive;
use std::path::PathBuf;
use tracing::{info, Level};

/// Exit code for when an error emerged while reading the DICOM file.
const ERROR_READ: i32 = -2;
/// Exit code for when an error emerged while decoding a frame.
const ERROR_DECODE: i32 = -3;
/// Exit code for when an error emerged while writing a cache file.
const ERROR_WRITE: i32 = -4;
/// Exit code for any other error.
const ERROR_OTHER: i32 = -128;

/// Decode DICOM pixel data into raw cache files
#[derive(Debug, Parser)]
#[command(version)]
struct App {
    file: PathBuf,

    /// The frame to decode (default is to decode all frames)
    #[clap(short = 'f', long = "frame")]
    frame: Option<u32>,

    /// The cache directory
    /// (default is a `dicom-rawcache` directory in the temporary directory)
    #[clap(long = "cache-dir")]
    cache_dir: Option<PathBuf>,

    /// Write the decoded frame to this file instead of the cache directory
    /// (requires --frame)
    #[clap(short = 'o', long = "output", requires = "frame")]
    output: Option<PathBuf>,

    /// Cache every frame, regardless of its size and sample type
    #[clap(long)]
    always: bool,

    /// Do not align the sign bit of signed samples
    #[clap(long = "no-rectify")]
    no_rectify: bool,

    /// Window center override
    #[clap(long = "center", requires = "width")]
    center: Option<f64>,

    /// Window width override
    #[clap(long = "width", requires = "center")]
    width: Option<f64>,

    /// Verbose mode
    #[clap(short = 'v', long = "verbose")]
    verbose: bool,
}

fn main() {
    run().unwrap_or_else(|e| {
        eprintln!("{}", Report::from_error(e));
        std::process::exit(ERROR_OTHER);
    });
}

fn run() -> Result<(), Whatever> {
    let App {
        file,
        frame,
        cache_dir,
        output,
        always,
        no_rectify,
        center,
        width,
        verbose,
    } = App::parse();

    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(if verbose { Level::DEBUG } else { Level::INFO })
            .finish(),
    )
    .unwrap_or_else(|e| {
        eprintln!("{}", snafu::Report::from_error(e));
    });

    let cache_dir = cache_dir.unwrap_or_else(|| std::env::temp_dir().join("dicom-rawcache"));
    let mut policy = dicom_pixelcore::CachePolicy::default();
    if always {
        policy.tile_size = 0;
    }
    let context = DecoderContext::builder()
        .cache_root(&cache_dir)
        .cache_policy(policy)
        .build();

    let mut source = PixelSource::open(&file).unwrap_or_else(|e| {
        eprintln!("{}", Report::from_error(e));
        std::process::exit(ERROR_READ);
    });

    let geometry = source.geometry().clone();
    println!(
        "{}: {}x{}, {} frame(s), {} bits allocated, {}, {}",
        file.display(),
        geometry.width,
        geometry.height,
        source.frame_count(),
        geometry.bits_allocated,
        geometry.photometric_interpretation,
        geometry.transfer_syntax_uid,
    );

    let params = ReadParams {
        rectify_signed: !no_rectify,
        ..ReadParams::default()
    };
    let overrides = WindowOverrides {
        center,
        width,
        ..WindowOverrides::default()
    };
    let mut windows = WindowCalculator::new();

    for frame in frames_to_decode(frame, source.frame_count()) {
        let raster = match &output {
            Some(_) => context.decode_raster(&mut source, frame, &params),
            None => context.decode_frame_cached(&mut source, frame, &params),
        }
        .unwrap_or_else(|e| {
            eprintln!("{}", Report::from_error(e));
            std::process::exit(ERROR_DECODE);
        });

        match windows.compute_window(&geometry, frame, Some(&raster), &overrides) {
            Ok(window) => println!(
                "frame #{}: {}x{}x{} {:?}, window center {} width {}{}",
                frame,
                raster.width(),
                raster.height(),
                raster.channels(),
                raster.sample_type(),
                window.center,
                window.width,
                if window.is_auto { " (auto)" } else { "" },
            ),
            Err(e) => eprintln!("frame #{}: {}", frame, Report::from_error(e)),
        }

        if let Some(output) = &output {
            RawCache::new(output)
                .write(&raster)
                .unwrap_or_else(|e| {
                    eprintln!("{}", Report::from_error(e));
                    std::process::exit(ERROR_WRITE);
                });
            info!("Frame #{} written to {}", frame, output.display());
        } else if let Some(cache) = context.cache_for(&source, frame, &params) {
            if cache.exists() {
                info!("Frame #{} cached at {}", frame, cache.path().display());
            }
        }
    }

    let fragments = source
        .number_of_fragments()
        .whatever_context("Could not count pixel data fragments")?;
    if fragments > 0 {
        info!("{} fragment(s) in encapsulated pixel data", fragments);
    }

    Ok(())
}

/// The frame asked for, or all of them.
fn frames_to_decode(frame: Option<u32>, frame_count: u32) -> RangeInclusive<u32> {
    match frame {
        Some(frame) => frame..=frame,
        // there is always at least one frame
        None => 0..=frame_count.saturating_sub(1),
    }
}
