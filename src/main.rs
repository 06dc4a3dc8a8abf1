use anyhow::Context;
use broker_adapter::sns::{decode_notification, SnsDelivery, SnsProtocol};
use broker_adapter::{
    build_adapter, handler_fn, Config, ConsumerConfig, EnvelopeFactory, EnvelopeOptions,
    PushEndpoint, SendOptions,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "broker-adapter")]
#[command(about = "Publish and consume events through a Kafka, SNS or in-memory broker", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
    config: PathBuf,

    #[arg(short, long, help = "Enable JSON output for logs")]
    json_logs: bool,

    #[arg(short, long, help = "Verbose logging")]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create every configured topic that does not exist yet
    Provision,

    /// Publish one event to an aggregate's topic
    Publish {
        #[arg(short, long)]
        aggregate: String,

        #[arg(short = 't', long)]
        event_type: String,

        #[arg(short, long, default_value = "/broker-adapter")]
        source: String,

        /// JSON payload
        #[arg(short, long, default_value = "{}")]
        data: String,

        #[arg(short, long, help = "Partition key")]
        key: Option<String>,
    },

    /// Consume an aggregate's events until interrupted
    Consume {
        #[arg(short, long, required = true)]
        aggregate: Vec<String>,

        #[arg(long)]
        from_beginning: bool,

        #[arg(long, help = "Deliver messages in batches")]
        batch: bool,

        #[arg(long, help = "Push endpoint for SNS subscriptions")]
        endpoint: Option<String>,

        #[arg(long, default_value = "https")]
        protocol: String,
    },

    /// Decode an SNS delivery body read from a file
    Decode {
        #[arg(value_name = "FILE")]
        body: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(args.json_logs, args.verbose);

    info!("Loading configuration from {:?}", args.config);
    let mut config = match Config::from_file(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    info!(
        backend = ?config.backend,
        create_topics = config.create_topics,
        topics = config.topics.len(),
        spec_version = %config.events.spec_version,
        "Configuration summary"
    );

    match args.command {
        Command::Provision => {
            config.create_topics = true;
            let mut adapter = build_adapter(&config).await?;
            adapter.init().await.context("provisioning failed")?;

            for descriptor in adapter.registry().descriptors() {
                println!(
                    "{}\t{}\t{}",
                    descriptor.aggregate,
                    descriptor.backend_id().unwrap_or("-"),
                    descriptor
                        .resolution()
                        .map(|r| r.to_string())
                        .unwrap_or_else(|| "unresolved".to_string())
                );
            }
            adapter.disconnect().await?;
        }
        Command::Publish {
            aggregate,
            event_type,
            source,
            data,
            key,
        } => {
            let data: serde_json::Value =
                serde_json::from_str(&data).context("--data must be valid JSON")?;
            let factory = EnvelopeFactory::from_config(&config.events);
            let envelope = factory.create(
                &aggregate,
                &event_type,
                &source,
                &data,
                EnvelopeOptions::default(),
            )?;

            let mut adapter = build_adapter(&config).await?;
            adapter.init().await?;
            let options = SendOptions { partition_key: key };
            let acks = adapter.send_message(&aggregate, &[envelope], options).await?;
            for ack in acks {
                println!("{}", serde_json::to_string(&ack_json(&ack))?);
            }
            adapter.disconnect().await?;
        }
        Command::Consume {
            aggregate,
            from_beginning,
            batch,
            endpoint,
            protocol,
        } => {
            let mut adapter = build_adapter(&config).await?;
            adapter.init().await?;

            let handler = handler_fn(|message| async move {
                let envelope = message.envelope()?;
                info!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    id = %envelope.id(),
                    event_type = %envelope.event_type(),
                    "Received event"
                );
                println!("{}", envelope.to_json_string()?);
                Ok::<(), anyhow::Error>(())
            });

            let mut consumer = ConsumerConfig::from_settings(&config.consumer)
                .use_batches(batch || config.consumer.use_batches);
            for name in aggregate {
                consumer = if from_beginning {
                    consumer.aggregate_from_beginning(name, handler.clone())
                } else {
                    consumer.aggregate(name, handler.clone())
                };
            }
            if let Some(endpoint) = endpoint {
                let protocol: SnsProtocol = protocol.parse()?;
                consumer = consumer.push_endpoint(PushEndpoint::new(protocol, endpoint));
            }

            let handle = adapter.add_consumer(consumer).await?;
            info!(topics = ?handle.topics(), "Consuming, press Ctrl-C to stop");

            tokio::signal::ctrl_c().await?;
            info!("Shutting down");
            handle.stop().await?;
            adapter.disconnect().await?;
        }
        Command::Decode { body } => {
            let bytes = std::fs::read(&body).with_context(|| format!("reading {:?}", body))?;
            match decode_notification(&bytes)? {
                SnsDelivery::Notification(message) => {
                    println!("{}", message.envelope()?.to_json_string()?);
                }
                SnsDelivery::SubscriptionConfirmation { subscribe_url, .. } => {
                    println!("confirm subscription: {}", subscribe_url);
                }
                SnsDelivery::UnsubscribeConfirmation { topic_arn } => {
                    println!("unsubscribed from {}", topic_arn);
                }
            }
        }
    }

    Ok(())
}

fn ack_json(ack: &broker_adapter::Ack) -> serde_json::Value {
    serde_json::json!({
        "id": ack.event_id,
        "topic": ack.topic,
        "partition": ack.partition,
        "offset": ack.offset,
        "messageId": ack.message_id,
        "sequenceNumber": ack.sequence_number,
    })
}

fn init_logging(json: bool, verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::new("broker_adapter=debug,info")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("broker_adapter=info,warn"))
    };

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
