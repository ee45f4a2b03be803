use std::{
    backtrace::{Backtrace, BacktraceStatus},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use alloy::primitives::{Address, U256, address};
use anyhow::{Result, anyhow};
use clap::Parser;
use opentelemetry_otlp::WithExportConfig;
use tokio::{select, time};
use tracing::*;
use tracing_subscriber::EnvFilter;
use uccb::{
    client::ChainClient,
    contracts::{
        target::{ITarget, Target},
        twin::{Twin, TwinResult},
    },
    error::RevertError,
    launcher::LocalBridge,
    query::{QueryPolicy, ReadOnlyQuery},
    read_config,
};

const TARGET_ADDRESS: Address = address!("0x0000000000000000000000000000000000007a46");
const TWIN_ADDRESS: Address = address!("0x0000000000000000000000000000000000007717");
const USER_ADDRESS: Address = address!("0x00000000000000000000000000000000000005e4");

#[derive(Parser, Debug)]
struct Args {
    #[clap(long, short, default_values = ["config.toml"])]
    config_file: Vec<PathBuf>,
    #[clap(long, default_value = "false")]
    log_json: bool,
    /// Relay `Target.test(num)` from the first chain to the second, print the result and exit. Without it, the
    /// bridge runs until interrupted.
    #[clap(long)]
    num: Option<u64>,
    /// Relay the demo call as a read-only query.
    #[clap(long, default_value = "false")]
    readonly: bool,
    /// Agreement required when also querying each validator's endpoint directly.
    #[clap(long, value_enum, default_value_t = QueryPolicy::Unanimous)]
    query_policy: QueryPolicy,
    /// How long to wait for the demo call's result.
    #[clap(long, default_value = "60")]
    timeout_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let builder = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_line_number(true)
        .with_ansi(false);
    if args.log_json {
        builder.json().init();
    } else {
        builder.init();
    }

    // Set a panic hook that records the panic as a `tracing` event at the `ERROR` verbosity level.
    std::panic::set_hook(Box::new(|panic| {
        let message = match panic.payload().downcast_ref::<&'static str>() {
            Some(s) => *s,
            None => match panic.payload().downcast_ref::<String>() {
                Some(s) => &s[..],
                None => "Box<dyn Any>",
            },
        };
        let thread = std::thread::current();
        let thread_name = thread.name().unwrap_or("<unnamed>");

        let backtrace = Backtrace::capture();
        let backtrace =
            (backtrace.status() == BacktraceStatus::Captured).then(|| backtrace.to_string());

        match (panic.location(), backtrace) {
            (None, None) => {
                tracing::error!(thread_name, message);
            }
            (None, Some(backtrace)) => {
                tracing::error!(thread_name, message, %backtrace);
            }
            (Some(location), None) => {
                tracing::error!(
                    thread_name,
                    message,
                    panic.file = location.file(),
                    panic.line = location.line(),
                    panic.column = location.column(),
                );
            }
            (Some(location), Some(backtrace)) => {
                tracing::error!(
                    thread_name,
                    message,
                    panic.file = location.file(),
                    panic.line = location.line(),
                    panic.column = location.column(),
                    %backtrace,
                );
            }
        }
    }));

    let config = read_config(&args.config_file)?;

    if let Some(endpoint) = &config.otlp_collector_endpoint {
        let exporter = opentelemetry_otlp::MetricExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint.clone())
            .build()?;
        let provider = opentelemetry_sdk::metrics::SdkMeterProvider::builder()
            .with_periodic_exporter(exporter)
            .build();
        opentelemetry::global::set_meter_provider(provider);
    }

    let mut bridge = LocalBridge::new(config)?;
    let [source, target] = bridge.chains() else {
        return Err(anyhow!("a bridge connects two chains"));
    };
    let (source, target) = (source.clone(), target.clone());

    let twin = Arc::new(Twin::default());
    source.deploy(TWIN_ADDRESS, twin.clone());
    target.deploy(TARGET_ADDRESS, Arc::new(Target));

    bridge.start_validators().await?;

    let Some(num) = args.num else {
        let result = select! {
            result = tokio::signal::ctrl_c() => result.map_err(anyhow::Error::from),
            result = bridge.join_validator() => result,
        };
        bridge.shutdown().await;
        return result;
    };

    if args.readonly {
        // Every validator answers from its own view of the target chain. Locally those views are one chain.
        let validators = target.validators();
        let endpoints: Vec<Arc<dyn ChainClient>> = (0..validators.len())
            .map(|_| target.clone() as Arc<dyn ChainClient>)
            .collect();
        let query = ReadOnlyQuery {
            caller: TWIN_ADDRESS,
            callee: TARGET_ADDRESS,
            payload: alloy::sol_types::SolCall::abi_encode(&ITarget::testCall {
                num: U256::from(num),
            }),
        };
        match query.run(&endpoints, validators.quorum_size(), args.query_policy).await {
            Ok(outcome) if outcome.success => println!("direct query: {}", outcome.result),
            Ok(outcome) => println!("direct query: {}", RevertError::new(outcome.result)),
            Err(e) => println!("direct query failed: {e}"),
        }
    }

    let receipt = source.transact(
        USER_ADDRESS,
        TWIN_ADDRESS,
        &Twin::start_input(TARGET_ADDRESS, num, args.readonly),
    );
    if !receipt.outcome.success {
        bridge.shutdown().await;
        return Err(anyhow!(
            "start failed: {}",
            RevertError::new(receipt.outcome.result)
        ));
    }
    info!(
        block_number = receipt.block_number,
        num,
        readonly = args.readonly,
        "relayed demo call"
    );

    let deadline = time::Instant::now() + Duration::from_secs(args.timeout_secs);
    let result = loop {
        if let Some((nonce, result)) = twin.results().into_iter().next() {
            break Ok((nonce, result));
        }
        if time::Instant::now() > deadline {
            break Err(anyhow!("no result after {}s", args.timeout_secs));
        }
        time::sleep(Duration::from_millis(50)).await;
    };
    bridge.shutdown().await;

    let (nonce, result) = result?;
    match result {
        TwinResult::Succeeded(value) => println!("nonce {nonce}: succeeded with {value}"),
        TwinResult::Failed(error) => println!("nonce {nonce}: failed with {error:?}"),
    }
    Ok(())
}
