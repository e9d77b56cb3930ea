use clap::{Parser, Subcommand};
use imux::{Acceptor, ConnectionPool, ExhaustedPolicy, ManyToOne, PoolConfig};
use tracing_subscriber::filter::EnvFilter;

fn run_split(args: SplitArgs) -> std::io::Result<()> {
    let config = args.pool.config();
    let pool = ConnectionPool::connect(args.remote.clone(), args.links, config)?;
    tracing::info!("Connected {} links to {}", pool.link_count(), args.remote);

    let listener = Acceptor::bind(args.listen)?;
    tracing::info!("Splitting connections accepted on {}", listener.local_addr()?);
    let result = imux::one_to_many(&listener, &pool);
    pool.shutdown();
    result
}

fn run_join(args: JoinArgs) -> std::io::Result<()> {
    let egress = ManyToOne::new(args.destination.clone(), args.pool.config())?;
    let listener = Acceptor::bind(args.listen)?;
    tracing::info!(
        "Joining links accepted on {} into {}",
        listener.local_addr()?,
        args.destination
    );
    let result = egress.serve(&listener);
    egress.shutdown();
    result
}

fn init_env_filter(env_filter: EnvFilter) {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_level(true)
        .with_target(true);

    let subscriber = subscriber.finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn main() -> std::io::Result<()> {
    // The library logs through `log`, bridge it first.
    tracing_log::LogTracer::init().expect("Failed to set logger");

    if let Ok(env_filter) = EnvFilter::try_from_default_env() {
        init_env_filter(env_filter);
    }

    let args = Args::parse();
    match args.command {
        Command::Split(args) => run_split(args),
        Command::Join(args) => run_join(args),
    }
}

/// Inverse multiplexes TCP connections over a pool of links
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Accept connections and split them over links to a `join` instance
    Split(SplitArgs),
    /// Accept links and write the reassembled connections to a destination
    Join(JoinArgs),
}

#[derive(clap::Args, Debug)]
struct SplitArgs {
    /// The address <ip:port> accepting client connections
    #[arg(short, long)]
    listen: String,
    /// The address <ip:port> of the `join` instance
    #[arg(short, long)]
    remote: String,
    /// The number of links to open
    #[arg(short = 'n', long, default_value = "4")]
    links: usize,
    #[command(flatten)]
    pool: PoolArgs,
}

#[derive(clap::Args, Debug)]
struct JoinArgs {
    /// The address <ip:port> accepting links
    #[arg(short, long)]
    listen: String,
    /// The address <ip:port> reassembled connections are written to
    #[arg(short, long)]
    destination: String,
    #[command(flatten)]
    pool: PoolArgs,
}

#[derive(clap::Args, Debug)]
struct PoolArgs {
    /// The chunk size in bytes, must match on both sides
    #[arg(short, long, default_value = "8192")]
    chunk_size: usize,
    /// The outgoing queue capacity in chunks, 0 for unbounded
    #[arg(short, long, default_value = "1024")]
    queue: usize,
    /// Wait for a link instead of failing when every link is gone
    #[arg(short, long)]
    block: bool,
    /// The bytes a connection may buffer while waiting for a missing chunk
    #[arg(short, long, default_value = "16777216")]
    max_buffered: usize,
}

impl PoolArgs {
    fn config(&self) -> PoolConfig {
        let policy = if self.block {
            ExhaustedPolicy::Block
        } else {
            ExhaustedPolicy::FailFast
        };
        PoolConfig::default()
            .with_chunk_size(self.chunk_size)
            .with_queue_capacity((self.queue > 0).then_some(self.queue))
            .with_exhausted_policy(policy)
            .with_max_buffered_bytes(self.max_buffered)
    }
}
