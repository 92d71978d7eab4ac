//! mudprod: persistent MUD session daemon

use clap::Parser;
use mudprod::{
    Cli, Client, Command, ConnectArgs, Daemon, Detached, Reply, ReplyBody, Server, TriggerAction,
    daemonize, default_log_path, default_pid_path, default_socket_path,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::error;
use tracing_subscriber::EnvFilter;

type CliResult = Result<(), Box<dyn std::error::Error>>;

/// How long `start` waits for the daemon's socket.
const START_TIMEOUT: Duration = Duration::from_secs(5);

fn main() {
    let cli = Cli::parse();

    let socket_path = cli.socket.clone().unwrap_or_else(default_socket_path);
    let pid_path = cli
        .pid_file
        .clone()
        .unwrap_or_else(|| default_pid_path(&socket_path));

    // Forking has to happen before the runtime starts any threads.
    let result = if let Command::Start { log_file, no_watch } = &cli.command {
        // The daemon inherits this subscriber; its stderr becomes the log file.
        init_logging(cli.verbose, true);
        let log_path = log_file
            .clone()
            .unwrap_or_else(|| default_log_path(&socket_path));
        start(&socket_path, &pid_path, &log_path, *no_watch)
    } else {
        init_logging(cli.verbose, matches!(cli.command, Command::Server { .. }));
        block_on(run(cli, socket_path, pid_path))
    };

    if let Err(e) = result {
        error!("{}", e);
        std::process::exit(1);
    }
}

fn init_logging(verbose: bool, daemon: bool) {
    let filter = if verbose {
        EnvFilter::new("mudprod=debug")
    } else if daemon {
        EnvFilter::new("mudprod=info")
    } else {
        EnvFilter::new("mudprod=warn")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn block_on<F: std::future::Future<Output = CliResult>>(future: F) -> CliResult {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(future)
}

/// Launch the daemon in the background.
fn start(
    socket_path: &Path,
    pid_path: &Path,
    log_path: &Path,
    no_watch: bool,
) -> CliResult {
    if std::os::unix::net::UnixStream::connect(socket_path).is_ok() {
        println!("already running");
        return Ok(());
    }

    match daemonize(log_path)? {
        Detached::Parent => {
            let client = Client::new(socket_path.to_path_buf());
            block_on(async move {
                client.wait_until_ready(START_TIMEOUT).await?;
                println!("started");
                Ok(())
            })
        }
        Detached::Daemon => {
            let server = Server::new(socket_path.to_path_buf(), Daemon::new(!no_watch))
                .with_pid_file(pid_path.to_path_buf());
            block_on(async move {
                server.run().await?;
                Ok(())
            })
        }
    }
}

async fn run(cli: Cli, socket_path: PathBuf, pid_path: PathBuf) -> CliResult {
    let client = Client::new(socket_path.clone());
    let session = cli.session.as_str();

    match cli.command {
        Command::Server { no_watch } => {
            let server = Server::new(socket_path, Daemon::new(!no_watch)).with_pid_file(pid_path);
            server.run().await?;
        }

        Command::Stop => {
            if client.is_server_running().await {
                client.shutdown().await?;
                println!("stopped");
            } else {
                println!("not running");
            }
        }

        command => {
            if !client.is_server_running().await {
                return Err("server not running (use: mudprod start)".into());
            }
            run_client(&client, session, command).await?;
        }
    }

    Ok(())
}

async fn run_client(client: &Client, session: &str, command: Command) -> CliResult {
    match command {
        Command::Connect {
            host,
            port,
            steps,
            timeout,
            success,
            failure,
            prompt,
            no_reconnect,
        } => {
            let mut args = ConnectArgs::new(host, port);
            args.login_steps = steps;
            args.timeout = timeout;
            args.success_patterns = (!success.is_empty()).then_some(success);
            args.failure_patterns = (!failure.is_empty()).then_some(failure);
            args.prompt_patterns = (!prompt.is_empty()).then_some(prompt);
            args.auto_reconnect = !no_reconnect;

            match body(client.connect(session, args).await?)? {
                ReplyBody::Connected { state, message } => {
                    println!("{}", serde_json::to_value(state)?.as_str().unwrap_or_default());
                    if let Some(message) = message {
                        tracing::debug!("{message}");
                    }
                }
                _ => return Err("unexpected response".into()),
            }
        }

        Command::Send { wait, text } => {
            let wait = Duration::try_from_secs_f64(wait)?;
            match body(client.send(session, &text.join(" "), wait).await?)? {
                ReplyBody::Send { clean, .. } => println!("{clean}"),
                _ => return Err("unexpected response".into()),
            }
        }

        Command::Raw { text } => {
            let line = format!("{}\n", text.join(" "));
            body(client.send_raw(session, &line).await?)?;
            println!("sent");
        }

        Command::Read => match body(client.read(session).await?)? {
            ReplyBody::Read { clean, .. } => println!("{clean}"),
            _ => return Err("unexpected response".into()),
        },

        Command::Peek { max_wait } => {
            let max_wait = Duration::try_from_secs_f64(max_wait)?;
            match body(client.peek(session, max_wait).await?)? {
                ReplyBody::Peek { clean, has_data, .. } => {
                    if has_data {
                        println!("{clean}");
                    }
                }
                _ => return Err("unexpected response".into()),
            }
        }

        Command::Batch {
            wait,
            fast,
            commands,
        } => {
            let wait = Duration::try_from_secs_f64(wait)?;
            match body(client.batch(session, commands, wait, fast).await?)? {
                ReplyBody::Batch { results, .. } => {
                    for item in results {
                        println!("> {}", item.command);
                        println!("{}", item.clean);
                    }
                }
                _ => return Err("unexpected response".into()),
            }
        }

        Command::Status { name, json } => {
            let reply = client.status(name.as_deref()).await?;
            if json {
                println!("{}", serde_json::to_string(&reply)?);
                return Ok(());
            }
            match body(reply)? {
                ReplyBody::Sessions { sessions } if sessions.is_empty() => {
                    println!("(no sessions)");
                }
                ReplyBody::Sessions { sessions } => {
                    // Default: TOON format (token-efficient for LLMs)
                    let rows: Vec<_> = sessions
                        .iter()
                        .map(|(name, status)| {
                            serde_json::json!({
                                "name": name,
                                "state": status.state,
                                "host": status.host,
                                "port": status.port,
                            })
                        })
                        .collect();
                    print_toon(&serde_json::json!({ "sessions": rows }));
                }
                ReplyBody::Status(status) => print_toon(&serde_json::to_value(status)?),
                _ => return Err("unexpected response".into()),
            }
        }

        Command::Disconnect => {
            print_message(body(client.disconnect(session).await?)?);
        }

        Command::Repeat { text } => {
            let text = if text.is_empty() {
                "off".to_string()
            } else {
                text.join(" ")
            };
            print_message(body(client.repeat(session, &text).await?)?);
        }

        Command::Trigger {
            remove,
            pattern,
            command,
        } => {
            let command = command.join(" ");
            let action = if remove {
                TriggerAction::Remove
            } else if pattern == "clear" && command.is_empty() {
                TriggerAction::Clear
            } else if command.is_empty() {
                return Err("usage: trigger PATTERN COMMAND  or  trigger clear".into());
            } else {
                TriggerAction::Add
            };
            print_message(body(client.trigger(session, &pattern, &command, action).await?)?);
        }

        Command::Triggers { json } => {
            let reply = client.triggers(session).await?;
            if json {
                println!("{}", serde_json::to_string(&reply)?);
                return Ok(());
            }
            match body(reply)? {
                ReplyBody::Triggers { triggers, repeat } => {
                    if triggers.is_empty() && repeat.is_none() {
                        println!("(no triggers set)");
                    } else {
                        let mut data = serde_json::json!({ "triggers": triggers });
                        if let Some(repeat) = repeat {
                            data["repeat"] = serde_json::json!(repeat);
                        }
                        print_toon(&data);
                    }
                }
                _ => return Err("unexpected response".into()),
            }
        }

        Command::Start { .. } | Command::Stop | Command::Server { .. } => {
            return Err("not a client command".into());
        }
    }

    Ok(())
}

/// Turn a failed reply into an error.
fn body(reply: Reply) -> Result<ReplyBody, Box<dyn std::error::Error>> {
    if reply.success {
        Ok(reply.body)
    } else {
        Err(reply
            .error_message()
            .unwrap_or("request failed")
            .to_string()
            .into())
    }
}

fn print_message(body: ReplyBody) {
    if let ReplyBody::Message { message } = body {
        println!("{message}");
    }
}

fn print_toon(value: &serde_json::Value) {
    let toon = toon_format::encode(value, &toon_format::EncodeOptions::default())
        .unwrap_or_else(|_| value.to_string());
    println!("{toon}");
}
