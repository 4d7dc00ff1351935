/// Node configuration.
///
/// Every option can come from the command line or from the environment
/// (`PORT`, `ADDRESS`, `VIEW`, `REPL_FACTOR`), the environment being how a
/// cluster deployment normally injects them.
use crate::types::View;
use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "shardkv", about = "Sharded, causally consistent key-value store node")]
pub struct Config {
    /// Port to serve HTTP on; the bind address is 0.0.0.0.
    #[arg(long, env = "PORT")]
    pub port: u16,

    /// This node's address exactly as it appears in views.
    #[arg(long, env = "ADDRESS")]
    pub address: String,

    /// Comma-separated list of member addresses forming the initial view.
    /// Defaults to a single-node view of this address.
    #[arg(long, env = "VIEW", value_delimiter = ',')]
    pub view: Vec<String>,

    /// Replication factor: members are grouped into shards of this size.
    #[arg(long, env = "REPL_FACTOR", default_value_t = 1)]
    pub repl_factor: usize,
}

impl Config {
    /// The initial view this node starts from.
    pub fn initial_view(&self) -> View {
        let members = if self.view.is_empty() {
            vec![self.address.clone()]
        } else {
            self.view.clone()
        };
        View::new(members, self.repl_factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_from_args() {
        let config = Config::try_parse_from([
            "shardkv",
            "--port",
            "13800",
            "--address",
            "10.10.0.2:13800",
            "--view",
            "10.10.0.2:13800,10.10.0.3:13800",
            "--repl-factor",
            "2",
        ])
        .unwrap();

        assert_eq!(config.port, 13800);
        assert_eq!(config.view.len(), 2);
        let view = config.initial_view();
        assert_eq!(view.repl_factor, 2);
        assert_eq!(view.shard_count(), 1);
    }

    #[test]
    fn test_view_defaults_to_self() {
        let config = Config::try_parse_from([
            "shardkv",
            "--port",
            "13800",
            "--address",
            "a:13800",
        ])
        .unwrap();

        let view = config.initial_view();
        assert_eq!(view.members, vec!["a:13800"]);
        assert_eq!(view.repl_factor, 1);
    }
}
