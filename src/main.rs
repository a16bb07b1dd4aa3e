//! CLI workflow: estimate field maps from multi-echo phase data and write
//! the field map and distortion correction map as NIfTI files.

use std::error::Error;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::info;

use unwarp::enums::PhaseEncodingDirection;
use unwarp::metadata::{
    MetadataError, echo_times_in_seconds, effective_echo_spacing, load_sidecar,
};
use unwarp::nifti_io::{read_volume, write_volume};
use unwarp::pipeline::{CorrectionOptions, estimate_and_correct};
use unwarp::volume::Volume;

#[derive(Parser, Debug)]
#[command(
    name = "unwarp",
    version,
    about = "Estimate field maps from multi-echo phase data and derive distortion correction maps"
)]
struct Args {
    /// Phase volume per echo (.nii or .nii.gz)
    #[arg(long, num_args = 1.., required = true, value_name = "FILE")]
    phase: Vec<PathBuf>,

    /// Magnitude volume per echo
    #[arg(long, num_args = 1.., required = true, value_name = "FILE")]
    magnitude: Vec<PathBuf>,

    /// JSON sidecar per echo; EchoTime is required for every echo,
    /// TotalReadoutTime and PhaseEncodingDirection for the first
    #[arg(long, num_args = 1.., required = true, value_name = "FILE")]
    metadata: Vec<PathBuf>,

    /// Prefix for the output files
    #[arg(long, default_value = "unwarp")]
    out_prefix: String,

    /// Number of noise frames at the end of the run to drop before
    /// estimation
    #[arg(short = 'f', long, default_value_t = 0)]
    noiseframes: usize,

    /// Only process the first N temporal frames
    #[arg(long, value_name = "N")]
    frames: Option<usize>,

    /// Number of worker threads
    #[arg(short = 'n', long, default_value_t = 4)]
    n_threads: usize,

    /// Also write the Jacobian determinant map
    #[arg(long)]
    jacobian: bool,

    /// Verbose logging
    #[arg(long)]
    debug: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();
    let level = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<(), Box<dyn Error>> {
    if args.phase.len() != args.magnitude.len() || args.phase.len() != args.metadata.len() {
        return Err(format!(
            "expected one magnitude and one sidecar per phase echo, got {} phase, \
             {} magnitude, {} metadata",
            args.phase.len(),
            args.magnitude.len(),
            args.metadata.len()
        )
        .into());
    }

    rayon::ThreadPoolBuilder::new()
        .num_threads(args.n_threads)
        .build_global()?;

    info!("loading {} echoes", args.phase.len());
    let mut phase = read_volumes(&args.phase)?;
    let mut magnitude = read_volumes(&args.magnitude)?;

    let sidecars = args
        .metadata
        .iter()
        .map(|p| load_sidecar(p))
        .collect::<Result<Vec<_>, _>>()?;
    let echo_times: Vec<f64> =
        echo_times_in_seconds(&sidecars.iter().map(|s| s.echo_time).collect::<Vec<_>>());

    let first = &sidecars[0];
    let missing = |field| MetadataError::MissingField {
        path: args.metadata[0].display().to_string(),
        field,
    };
    let total_readout_time = first
        .total_readout_time
        .ok_or_else(|| missing("TotalReadoutTime"))?;
    let direction: PhaseEncodingDirection = first
        .phase_encoding_direction
        .as_deref()
        .ok_or_else(|| missing("PhaseEncodingDirection"))?
        .parse()?;

    if args.noiseframes > 0 {
        info!("dropping {} noise frame(s) from the end of the run", args.noiseframes);
        let nt = phase[0].num_frames();
        let keep = nt.saturating_sub(args.noiseframes);
        if keep == 0 {
            return Err(format!(
                "cannot drop {} noise frames from a {nt}-frame run",
                args.noiseframes
            )
            .into());
        }
        for volume in phase.iter_mut().chain(magnitude.iter_mut()) {
            volume.truncate_frames(keep);
        }
    }

    let shape = phase[0].spatial_shape();
    let lines = [shape.0, shape.1, shape.2][direction.axis.index()];
    let echo_spacing = effective_echo_spacing(total_readout_time, lines)?;
    info!(
        "phase encoding {direction}, {lines} lines, effective echo spacing {echo_spacing:.3e} s"
    );

    let options = CorrectionOptions {
        frame_limit: args.frames,
        inversion: unwarp::invert::InversionOptions {
            compute_jacobian: args.jacobian,
            ..Default::default()
        },
    };
    let result = estimate_and_correct(
        &phase,
        &magnitude,
        &echo_times,
        echo_spacing,
        direction,
        &options,
    )?;

    let fieldmap_path = PathBuf::from(format!("{}_fieldmap.nii.gz", args.out_prefix));
    let correction_path = PathBuf::from(format!("{}_correction.nii.gz", args.out_prefix));
    info!("writing {}", fieldmap_path.display());
    write_volume(&fieldmap_path, &result.field_map)?;
    info!("writing {}", correction_path.display());
    write_volume(&correction_path, &result.correction_map)?;
    if let Some(jacobian) = &result.jacobian_map {
        let jacobian_path = PathBuf::from(format!("{}_jacobian.nii.gz", args.out_prefix));
        info!("writing {}", jacobian_path.display());
        write_volume(&jacobian_path, jacobian)?;
    }

    info!("done");
    Ok(())
}

fn read_volumes(paths: &[PathBuf]) -> Result<Vec<Volume>, Box<dyn Error>> {
    paths
        .iter()
        .map(|p| read_volume(p).map_err(Into::into))
        .collect()
}
