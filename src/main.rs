use std::env;

use anyhow::{anyhow, Context};

use redlite::server::{Server, ServerOptions};

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let mut opts = ServerOptions::default();
    let mut args = env::args();
    let _ = args.next();
    while let Some(arg) = args.next() {
        if arg.eq("--port") {
            let port_text = args.next().ok_or(anyhow!("port arg not found"))?;
            opts.port = port_text
                .parse::<u16>()
                .with_context(|| "port is not a number between 0 and 65536")?;
        } else if arg.eq("--replicaof") {
            let target = args.next().ok_or(anyhow!("replicaof target not found"))?;
            let (host, port) = target
                .split_once(char::is_whitespace)
                .ok_or(anyhow!("replicaof expects \"<host> <port>\""))?;
            let port = port
                .trim()
                .parse::<u16>()
                .with_context(|| "master port is not a number between 0 and 65536")?;
            opts.replicaof = Some((host.to_string(), port));
        } else {
            return Err(anyhow!("invalid cli arg \"{arg}\""));
        }
    }

    Server::bind(opts)?.run()
}
