use std::io::{self, BufRead, Write};
use std::process::ExitCode;

use clap::Parser;
use log::info;
use rand::{rngs::StdRng, SeedableRng};

use matmul_offload::config::{DEFAULT_GROUP_SIZE, DEFAULT_MATRIX_SIZE};
use matmul_offload::{
    Backend, BackendKind, DeviceKind, HostBackend, Matrix, Offload, OffloadConfig, OffloadError,
    OffloadReport, WgpuBackend, DEFAULT_TOLERANCE,
};

/// Multiply two random N×N matrices on a CPU or GPU compute device and
/// report the achieved throughput.
#[derive(Parser, Debug)]
#[command(name = "matmul-offload", version, about, long_about = None)]
struct Args {
    /// Matrix dimension N (all matrices are N×N)
    #[arg(short = 'n', long, env = "MATMUL_SIZE", default_value_t = DEFAULT_MATRIX_SIZE)]
    size: usize,

    /// Local work-group extent W along both axes; must divide N
    #[arg(short = 'w', long, env = "MATMUL_GROUP_SIZE", default_value_t = DEFAULT_GROUP_SIZE)]
    group_size: usize,

    /// Compute device category; prompts interactively when omitted
    #[arg(short, long, env = "MATMUL_DEVICE", value_enum)]
    device: Option<DeviceKind>,

    /// Execution backend
    #[arg(short, long, env = "MATMUL_BACKEND", value_enum, default_value_t = BackendKind::Wgpu)]
    backend: BackendKind,

    /// Seed for reproducible input matrices
    #[arg(long, env = "MATMUL_SEED")]
    seed: Option<u64>,

    /// Check the product against the host reference
    #[arg(long)]
    verify: bool,
}

fn prompt_device() -> Result<DeviceKind, OffloadError> {
    print!("Select compute device: 1) CPU  2) GPU > ");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(DeviceKind::from_choice(&line))
}

fn execute<B: Backend>(backend: &B, args: &Args, kind: DeviceKind) -> Result<OffloadReport, OffloadError> {
    let config = OffloadConfig::new(args.size, args.group_size);
    let offload = match args.seed {
        Some(seed) => Offload::random(&config, &mut StdRng::seed_from_u64(seed))?,
        None => Offload::random(&config, &mut rand::thread_rng())?,
    };
    let expected: Option<Matrix> = if args.verify {
        Some(offload.reference_product()?)
    } else {
        None
    };
    let report = offload.run(backend, kind)?;
    if let Some(expected) = expected {
        report.verify(&expected, DEFAULT_TOLERANCE)?;
        info!("product verified against host reference");
    }
    Ok(report)
}

fn run(args: &Args) -> Result<(), OffloadError> {
    // Reject a bad partition before asking which device to use.
    OffloadConfig::new(args.size, args.group_size).partition()?;
    let kind = match args.device {
        Some(kind) => kind,
        None => prompt_device()?,
    };
    println!("Using {kind} device");

    let report = match args.backend {
        BackendKind::Wgpu => execute(&WgpuBackend, args, kind)?,
        BackendKind::Host => execute(&HostBackend::new(), args, kind)?,
    };

    println!("Device: {}", report.device);
    println!(
        "Matrix size: {n}x{n}, work-group: {w}x{w}",
        n = args.size,
        w = args.group_size
    );
    println!("Elapsed: {:.6} s", report.timing.seconds());
    println!("Throughput: {:.3} GFLOPS", report.timing.gflops());
    if args.verify {
        println!("Verification: OK");
    }
    Ok(())
}

/// The single line printed to stderr when a run fails.
fn failure_message(err: &OffloadError) -> String {
    format!("error during {}: {err}", err.stage())
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{}", failure_message(&err));
            ExitCode::from(err.exit_code())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_is_reported_once_with_its_stage() {
        let err = OffloadError::DeviceUnavailable {
            kind: DeviceKind::Gpu,
        };
        let message = failure_message(&err);
        assert!(message.starts_with(&format!("error during {}: ", err.stage())));
        assert_eq!(message.matches(&err.to_string()).count(), 1);
        assert_eq!(message.lines().count(), 1);
    }
}
