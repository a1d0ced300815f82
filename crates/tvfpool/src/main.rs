use std::process;
use std::sync::Arc;

use tvfpool::config::PoolConfig;
use tvfpool::functions::builtin_registry;
use tvfpool::transport::ServerConfig;
use tvfpool::{PoolService, WorkerMode, build_workers, logging};

const USAGE: &str = "\
Usage: tvfpool serve [--host <addr>] [--port <port>] [--pool-size <n>] [--max-pool-size <n>] [--local]
       tvfpool worker

Commands:
  serve     Run the HTTP server and the worker pool
  worker    Serve sessions over stdin/stdout (started by the pool)

Options:
  --host <addr>          Listen address [default: 0.0.0.0]
  --port <port>          Listen port [default: 8787]
  --pool-size <n>        Concurrent sessions [default: 4, env TVF_POOL_SIZE]
  --max-pool-size <n>    Upper bound for resize [default: 16, env TVF_MAX_POOL_SIZE]
  --local                Run functions in-process instead of worker processes";

#[derive(Debug)]
enum Command {
    Serve {
        server: ServerConfig,
        pool_size: Option<usize>,
        max_pool_size: Option<usize>,
        local: bool,
    },
    Worker,
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let command = match parse_args(&args) {
        Ok(command) => command,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("{USAGE}");
            process::exit(2);
        }
    };

    logging::init_tracing();

    if let Err(e) = run(command) {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn parse_value<T: std::str::FromStr>(flag: &str, value: Option<&String>) -> Result<T, String> {
    let value = value.ok_or_else(|| format!("{flag} requires a value"))?;
    value
        .parse()
        .map_err(|_| format!("{flag}: invalid value '{value}'"))
}

fn parse_args(args: &[String]) -> Result<Command, String> {
    let Some(command) = args.get(1) else {
        return Err("missing command".to_string());
    };

    match command.as_str() {
        "worker" => {
            if let Some(extra) = args.get(2) {
                return Err(format!("unexpected argument: {extra}"));
            }
            Ok(Command::Worker)
        }
        "serve" => {
            let mut server = ServerConfig::default();
            let mut pool_size = None;
            let mut max_pool_size = None;
            let mut local = false;

            let mut i = 2;
            while i < args.len() {
                match args[i].as_str() {
                    "--host" => {
                        i += 1;
                        server.host = args.get(i).ok_or("--host requires a value")?.clone();
                    }
                    "--port" => {
                        i += 1;
                        server.port = parse_value("--port", args.get(i))?;
                    }
                    "--pool-size" => {
                        i += 1;
                        pool_size = Some(parse_value("--pool-size", args.get(i))?);
                    }
                    "--max-pool-size" => {
                        i += 1;
                        max_pool_size = Some(parse_value("--max-pool-size", args.get(i))?);
                    }
                    "--local" => local = true,
                    "--help" | "-h" => return Err(String::new()),
                    arg => return Err(format!("unexpected argument: {arg}")),
                }
                i += 1;
            }

            Ok(Command::Serve {
                server,
                pool_size,
                max_pool_size,
                local,
            })
        }
        "--help" | "-h" => Err(String::new()),
        other => Err(format!("unknown command: {other}")),
    }
}

fn run(command: Command) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Runtime::new()?;
    let functions = Arc::new(builtin_registry());

    match command {
        Command::Worker => runtime.block_on(tvfpool::run_worker(functions))?,
        Command::Serve {
            server,
            pool_size,
            max_pool_size,
            local,
        } => {
            let mut config = PoolConfig::from_env()?;
            if let Some(n) = pool_size {
                config.pool_size = n;
            }
            if let Some(n) = max_pool_size {
                config.max_limit = n;
            }
            if local {
                config.worker_mode = WorkerMode::Local;
            }
            config.validate()?;

            runtime.block_on(async move {
                let workers = build_workers(&config, functions)?;
                let service = Arc::new(PoolService::new(config, workers));
                service.start().await;
                tvfpool::transport::serve(server, service).await?;
                anyhow::Ok(())
            })?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("tvfpool")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn parses_serve_flags() {
        let command = parse_args(&args(&[
            "serve",
            "--port",
            "9000",
            "--pool-size",
            "2",
            "--local",
        ]))
        .unwrap();
        match command {
            Command::Serve {
                server,
                pool_size,
                max_pool_size,
                local,
            } => {
                assert_eq!(server.port, 9000);
                assert_eq!(pool_size, Some(2));
                assert_eq!(max_pool_size, None);
                assert!(local);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn parses_worker() {
        assert!(matches!(parse_args(&args(&["worker"])), Ok(Command::Worker)));
    }

    #[test]
    fn rejects_bad_input() {
        assert!(parse_args(&args(&[])).is_err());
        assert!(parse_args(&args(&["serve", "--port"])).is_err());
        assert!(parse_args(&args(&["serve", "--port", "http"])).is_err());
        assert!(parse_args(&args(&["launch"])).is_err());
    }
}
