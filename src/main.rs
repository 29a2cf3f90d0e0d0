//! sockstun - SOCKS5 tunnel engine for a TUN descriptor

use std::path::PathBuf;

use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use sockstun::config::{Config, ConfigSource, ConfigValidator};
use sockstun::device::{Descriptor, FixedResolver};
use sockstun::Engine;

fn main() {
    let args = Args::parse();

    if args.version {
        print_version();
        return;
    }

    if let Some(path) = args.check {
        std::process::exit(check(path));
    }

    let Some(config) = args.config else {
        eprintln!("Missing -c <FILE>");
        print_help();
        std::process::exit(1);
    };
    let Some(fd) = args.fd else {
        eprintln!("Missing --fd <N>");
        std::process::exit(-1);
    };

    let source = ConfigSource::file(config);
    init_logging(&source);

    std::process::exit(run(source, fd));
}

/// Level from RUST_LOG, else the config's log-level, else INFO
fn init_logging(source: &ConfigSource) {
    let log_level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|s| s.parse().ok())
        .or_else(|| {
            source
                .read()
                .ok()
                .and_then(|text| Config::from_text(&text).ok())
                .and_then(|config| config.log_level.parse().ok())
        })
        .unwrap_or(Level::INFO);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }
}

fn run(source: ConfigSource, fd: Descriptor) -> i32 {
    let engine = match Engine::new(FixedResolver(fd)) {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("{}", e);
            return e.exit_code();
        }
    };

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Failed to build runtime: {}", e);
            return 3;
        }
    };

    let mut done = engine.start_async(source, |code| info!("Engine exited with {}", code));

    runtime.block_on(async {
        tokio::select! {
            code = &mut done => code.unwrap_or(3),
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                engine.stop();
                done.await.unwrap_or(3)
            }
        }
    })
}

/// Validate a config file and print the outcome
fn check(path: PathBuf) -> i32 {
    let source = ConfigSource::file(&path);
    if path.extension().map_or(true, |ext| ext != "conf") {
        eprintln!("warning: {} is not a .conf file", path.display());
    }

    match ConfigValidator::new().validate(&source) {
        Ok(config) => {
            println!("{}: ok", path.display());
            println!("  server:  {}", config.server);
            println!("  listen:  {}", config.listen);
            println!("  pool:    {} (pre-warm {})", config.pool_size, config.pool_prewarm);
            println!("  flows:   {}", config.max_flows);
            0
        }
        Err(e) => {
            eprintln!("{}: {}", path.display(), e);
            e.exit_code()
        }
    }
}

/// Command line arguments
struct Args {
    config: Option<PathBuf>,
    fd: Option<Descriptor>,
    check: Option<PathBuf>,
    version: bool,
}

impl Args {
    fn parse() -> Self {
        let args: Vec<String> = std::env::args().collect();
        let mut config = None;
        let mut fd = None;
        let mut check = None;
        let mut version = false;

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "-c" | "--config" => {
                    if i + 1 < args.len() {
                        config = Some(PathBuf::from(&args[i + 1]));
                        i += 1;
                    }
                }
                "--fd" => {
                    if i + 1 < args.len() {
                        fd = args[i + 1].parse().ok();
                        i += 1;
                    }
                }
                "--check" => {
                    if i + 1 < args.len() {
                        check = Some(PathBuf::from(&args[i + 1]));
                        i += 1;
                    }
                }
                "-v" | "--version" => version = true,
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                arg if !arg.starts_with('-') && config.is_none() => {
                    // Positional argument: treat as config file
                    config = Some(PathBuf::from(arg));
                }
                _ => {}
            }
            i += 1;
        }

        Self { config, fd, check, version }
    }
}

fn print_help() {
    println!(r#"sockstun - SOCKS5 tunnel engine

USAGE:
    sockstun -c <FILE> --fd <N>
    sockstun --check <FILE>

OPTIONS:
    -c, --config <FILE>     Path to the .conf file
    --fd <N>                Descriptor of an open TUN interface
    --check <FILE>          Validate a config file and exit
    -v, --version           Print version information
    -h, --help              Print help information

CONFIG:
    listen=127.0.0.1:1080
    server=proxy.example.com:1080
    type=socks5
    # optional: username, password, pool-size, max-flows, log-level, ...

EXIT CODES:
    0 stopped, -1 no interface, 1 invalid config, 2 unreadable config,
    3 I/O, 4 auth failed, 5 protocol mismatch, 6 server unreachable,
    7 timeout, 8 resources exhausted, 9 already running, 10 other
"#);
}

fn print_version() {
    println!("sockstun v{}", env!("CARGO_PKG_VERSION"));
    println!("SOCKS5 tunnel engine for virtual network interfaces");
}
