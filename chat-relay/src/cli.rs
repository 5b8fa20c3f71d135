use std::net::SocketAddr;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay, accepting TCP connections from chat clients.
    Relay(RelayArgs),
    /// Join a relay and exchange direct messages from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct RelayArgs {
    /// Socket address the relay should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:5000")]
    pub listen: SocketAddr,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Display name requested when joining; the relay prefixes it with a sequence number.
    #[arg(long)]
    pub name: String,

    /// Address of the relay to connect to.
    #[arg(long, default_value = "127.0.0.1:5000")]
    pub server: SocketAddr,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_defaults_to_local_port_5000() {
        let cli = Cli::try_parse_from(["chat_relay", "relay"]).expect("parse");
        match cli.command {
            Command::Relay(args) => assert_eq!(args.listen, "127.0.0.1:5000".parse().unwrap()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn client_requires_a_name() {
        assert!(Cli::try_parse_from(["chat_relay", "client"]).is_err());

        let cli = Cli::try_parse_from([
            "chat_relay",
            "client",
            "--name",
            "Ana",
            "--server",
            "127.0.0.1:7000",
        ])
        .expect("parse");
        match cli.command {
            Command::Client(args) => {
                assert_eq!(args.name, "Ana");
                assert_eq!(args.server.port(), 7000);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn invalid_listen_address_is_rejected() {
        assert!(Cli::try_parse_from(["chat_relay", "relay", "--listen", "not-an-addr"]).is_err());
    }
}
