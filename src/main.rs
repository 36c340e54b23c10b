use std::process::ExitCode;
use std::str::FromStr;
use std::time::{Duration, Instant};

use clap::Parser;
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RecordType};
use tracing_subscriber::EnvFilter;

use nioresolv::{Dispatcher, Resolver, ResolverConfig};

#[derive(Parser)]
#[command(name = "nioresolv")]
#[command(about = "Send a DNS query through the nioresolv engine", long_about = None)]
struct Args {
    /// Name to look up
    name: String,

    /// Record type (A, AAAA, MX, TXT, ...)
    #[arg(short = 't', long = "type", default_value = "A")]
    record_type: String,

    /// Server to query
    #[arg(short, long, default_value = "127.0.0.1")]
    server: String,

    /// Server port
    #[arg(short, long, default_value_t = 53)]
    port: u16,

    /// Query over TCP
    #[arg(long)]
    tcp: bool,

    /// Query timeout in milliseconds
    #[arg(long, default_value_t = 10_000)]
    timeout_ms: u64,

    /// Share one socket across queries
    #[arg(long)]
    single_port: bool,

    /// Accept truncated UDP replies as they are
    #[arg(long)]
    ignore_truncation: bool,

    /// Log engine internals
    #[arg(short, long)]
    verbose: bool,
}

fn build_query(name: &str, record_type: &str) -> Result<Message, String> {
    let name = Name::from_str(name).map_err(|e| format!("invalid name {name}: {e}"))?;
    let record_type = RecordType::from_str(&record_type.to_ascii_uppercase())
        .map_err(|e| format!("invalid record type {record_type}: {e}"))?;

    let mut message = Message::new();
    message
        .set_id(rand::random())
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .add_query(Query::query(name, record_type));
    Ok(message)
}

fn run(args: Args) -> Result<(), String> {
    let query = build_query(&args.name, &args.record_type)?;

    let mut config = ResolverConfig::from_host(&args.server, args.port).map_err(|e| e.to_string())?;
    config.timeout = Duration::from_millis(args.timeout_ms);
    config.tcp = args.tcp;
    config.ignore_truncation = args.ignore_truncation;
    config.single_udp_port = args.single_port;
    config.single_tcp_port = args.single_port;
    config.edns_payload = Some(0);

    let dispatcher = Dispatcher::new().map_err(|e| format!("failed to start dispatcher: {e}"))?;
    let resolver = Resolver::new(config, dispatcher.clone());

    let started = Instant::now();
    let result = resolver.send(&query);
    let elapsed = started.elapsed();
    dispatcher.shutdown();

    let reply = result.map_err(|e| e.to_string())?;
    println!(
        ";; {} from {} in {:.1}ms, {} answers",
        reply.response_code(),
        resolver.config().server,
        elapsed.as_secs_f64() * 1000.0,
        reply.answers().len()
    );
    for record in reply.answers() {
        println!("{record}");
    }
    if args.verbose {
        let stats = dispatcher.stats().snapshot();
        println!(
            ";; connections: {}, bind retries: {}",
            stats.connections, stats.bind_retries
        );
    }
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();

    let default_level = if args.verbose { "nioresolv=debug" } else { "nioresolv=warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("nioresolv: {e}");
            ExitCode::FAILURE
        }
    }
}
