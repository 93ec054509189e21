// =============================================================================
// VKCOMPUTE - command line front end
// =============================================================================
//
// JOBS:
//   copy            identity kernel over [1.0 ..= 32.0] on every usable device
//   sha256 [MSG]    one-block SHA-256 on the first usable device
//   mine            batched best-digest search over prefix + charset^nonce_len
//
// Backend failures are fatal: a diagnostic goes to stderr and the process
// exits with status 1.
//
// =============================================================================

use anyhow::{bail, Result};
use vkcompute::backend::{self, Instance};
use vkcompute::config::Config;
use vkcompute::jobs;
use vkcompute::search::{GpuHasher, Miner, MinerBuffers};

fn main() {
    // Load configuration from config.toml
    let config = Config::load();

    init_logging(&config);
    log::info!("Starting vkcompute");

    let args: Vec<String> = std::env::args().skip(1).collect();
    let job = args.first().map(String::as_str).unwrap_or("copy");
    let rest = args.get(1..).unwrap_or(&[]);

    if let Err(err) = run(&config, job, rest) {
        match err.downcast_ref::<backend::Error>() {
            Some(backend_err) => backend::report(backend_err),
            None => eprintln!("error: {:#}", err),
        }
        std::process::exit(1);
    }
}

/// Initialize logging; RUST_LOG overrides the configured level
fn init_logging(config: &Config) {
    use env_logger::{Builder, Env};

    let mut builder = Builder::from_env(Env::default());
    if std::env::var_os("RUST_LOG").is_none() {
        builder.filter_level(config.log_level());
    }
    builder.init();
}

fn run(config: &Config, job: &str, rest: &[String]) -> Result<()> {
    let instance = backend::or_exit(Instance::new(&config.instance_desc()));

    match job {
        "copy" => {
            const SIZE: usize = 32;
            let values: Vec<f32> = (1..=SIZE).map(|v| v as f32).collect();

            for device in backend::or_exit(instance.devices()) {
                let device = match device {
                    Ok(device) => device,
                    Err(err @ backend::Error::NoComputeQueue { .. }) => {
                        log::warn!("Skipping device: {}", err);
                        continue;
                    }
                    Err(err) => backend::or_exit(Err(err)),
                };

                println!("{}", device.name());
                let output = jobs::copy_roundtrip(&device, &config.shader_path("copy"), &values)?;
                for (i, value) in output.iter().enumerate() {
                    println!("{}: {:.6}", i, value);
                }
            }
        }
        "sha256" => {
            let message = rest.first().map(String::as_str).unwrap_or("hello");
            let device = backend::or_exit(instance.first_device());

            let digest =
                jobs::sha256_once(&device, &config.shader_path("sha256"), message.as_bytes())?;
            println!("{}", jobs::hex(&digest));
        }
        "mine" => {
            let miner_config = &config.miner;
            let device = backend::or_exit(instance.first_device());

            let buffers = backend::or_exit(MinerBuffers::new(&device, miner_config.batch_size));
            let hasher = backend::or_exit(GpuHasher::new(
                &device,
                config.shader_path("sha256_miner"),
                &buffers,
            ));

            let mut miner = Miner::new(hasher, miner_config.charset.as_bytes());
            let report = miner.search(miner_config.prefix.as_bytes(), miner_config.nonce_len)?;

            if let Some(best) = &report.best {
                println!("{}: {}", best.message, best.digest);
            }
            println!(
                "{} hashes, {} ms ({:.2} Mhashes/sec)",
                report.hashes,
                report.elapsed.as_millis(),
                report.mhashes_per_sec()
            );
        }
        other => bail!("unknown job '{}' (expected copy, sha256 or mine)", other),
    }

    Ok(())
}
