//! Lotkeeper CLI - migrations and warehouse operations.
//!
//! # Usage
//!
//! ```bash
//! # Run database migrations
//! lk migrate
//!
//! # Receive a lot, then allocate and pick an order
//! lk --actor 7 receive -n LOT-0042 -p 12 -q 50 -u kg --expiry 2024-01-10
//! lk --actor 7 order create SO-1001 --line 12:60
//! lk --actor 7 allocate 1
//! lk --actor 7 pick 1 42 50
//!
//! # Convert two lots into one and trace the result
//! lk --actor 7 convert -s 3:20 -s 4:15 -p 90 -q 30 -u jar
//! lk trace 5 --direction upstream
//!
//! # Recall everything connected to a lot number fragment
//! lk recall --lot farm-x
//! ```
//!
//! # Commands
//!
//! - `migrate` - Run database migrations
//! - `receive`, `lot` - Receiving and lot maintenance
//! - `order`, `allocate`, `deallocate`, `ready`, `ship` - Order lifecycle
//! - `pick`, `unpick`, `unship` - Physical withdrawals and their reversal
//! - `convert` - Production conversion
//! - `lineage`, `trace`, `recall` - Traceability
//!
//! Results are written to stdout as JSON (or YAML with `--format yaml`); logs
//! go to stderr.

#![cfg_attr(not(test), forbid(unsafe_code))]

use std::path::PathBuf;

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use sentry::integrations::tracing as sentry_tracing;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lotkeeper_core::LotStatus;
use lotkeeper_warehouse::config::WarehouseConfig;
use lotkeeper_warehouse::models::{ConversionSource, CreateOrderItemInput, TraceDirection};

mod commands;

use commands::{CliError, OutputFormat};

#[derive(Parser)]
#[command(name = "lk")]
#[command(author, version, about = "Lotkeeper warehouse CLI")]
struct Cli {
    /// Actor recorded on every mutation
    #[arg(long, global = true, env = "LK_ACTOR")]
    actor: Option<i32>,

    /// Output format for results
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Json)]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run database migrations
    Migrate,
    /// Receive a new lot
    Receive {
        /// Lot number printed on the paperwork
        #[arg(short = 'n', long)]
        lot_number: String,

        /// Product ID
        #[arg(short, long)]
        product: i32,

        /// Quantity received
        #[arg(short, long)]
        quantity: Decimal,

        /// Unit of measure
        #[arg(short, long)]
        unit: String,

        /// Date received (defaults to today)
        #[arg(long)]
        received: Option<NaiveDate>,

        /// Expiry date
        #[arg(long)]
        expiry: Option<NaiveDate>,

        /// Supplier or farm of origin
        #[arg(long)]
        origin: Option<String>,

        /// Hold the lot in QC before it becomes available
        #[arg(long)]
        qc: bool,
    },
    /// Inspect and maintain lots
    Lot {
        #[command(subcommand)]
        action: LotAction,
    },
    /// Create and inspect orders
    Order {
        #[command(subcommand)]
        action: OrderAction,
    },
    /// Reserve stock for a draft order, earliest expiry first
    Allocate {
        /// Order ID
        order_id: i32,
    },
    /// Release the reservations of a confirmed, unpicked order
    Deallocate {
        /// Order ID
        order_id: i32,
    },
    /// Withdraw quantity from a lot for an order item
    Pick {
        /// Order item ID
        item_id: i32,
        /// Lot ID
        lot_id: i32,
        /// Quantity picked
        quantity: Decimal,
    },
    /// Revert a pick, restoring the lot and the reservation
    Unpick {
        /// Pick ID
        pick_id: i32,
    },
    /// Mark a fully picked order ready to ship
    Ready {
        /// Order ID
        order_id: i32,
    },
    /// Ship a ready order
    Ship {
        /// Order ID
        order_id: i32,
    },
    /// Reverse a shipment, restoring every picked quantity
    Unship {
        /// Order ID
        order_id: i32,
    },
    /// Consume source lots into a new produced lot
    Convert {
        /// Source as `lot_id:quantity` (repeatable, consumed in order)
        #[arg(short, long = "source", value_parser = parse_source, required_unless_present = "plan")]
        sources: Vec<ConversionSource>,

        /// Product ID of the produced lot
        #[arg(short, long, required_unless_present = "plan")]
        product: Option<i32>,

        /// Quantity produced
        #[arg(short, long, required_unless_present = "plan")]
        quantity: Option<Decimal>,

        /// Unit of the produced quantity
        #[arg(short, long, required_unless_present = "plan")]
        unit: Option<String>,

        /// Lot number for the produced lot (generated when omitted)
        #[arg(short = 'n', long)]
        lot_number: Option<String>,

        /// Expiry of the produced lot (defaults to the earliest source expiry)
        #[arg(long)]
        expiry: Option<NaiveDate>,

        /// Read the whole conversion from a YAML or JSON file instead
        #[arg(long, conflicts_with_all = ["sources", "product", "quantity", "unit"])]
        plan: Option<PathBuf>,
    },
    /// One-hop lineage of a lot
    Lineage {
        /// Lot ID
        lot_id: i32,
    },
    /// Genealogy closure around a lot
    Trace {
        /// Lot ID
        lot_id: i32,

        /// `upstream`, `downstream` or `both`
        #[arg(short, long, default_value = "both")]
        direction: TraceDirection,

        /// Maximum production hops (capped by `WAREHOUSE_LINEAGE_MAX_DEPTH`)
        #[arg(long)]
        max_depth: Option<usize>,
    },
    /// Recall report for a lot number or order number fragment
    Recall {
        /// Lot number fragment
        #[arg(long, conflicts_with = "order", required_unless_present = "order")]
        lot: Option<String>,

        /// Order number fragment
        #[arg(long)]
        order: Option<String>,

        /// Maximum production hops (capped by `WAREHOUSE_LINEAGE_MAX_DEPTH`)
        #[arg(long)]
        max_depth: Option<usize>,
    },
}

#[derive(Subcommand)]
enum LotAction {
    /// Show a lot by ID or lot number
    Show {
        /// Lot ID or lot number
        lot: String,
    },
    /// Change a lot's status (QC release, quarantine, expiry)
    Status {
        /// Lot ID
        lot_id: i32,
        /// New status
        status: LotStatus,
    },
    /// Correct a lot's on-hand quantity by a signed delta
    Adjust {
        /// Lot ID
        lot_id: i32,
        /// Signed quantity delta
        #[arg(allow_hyphen_values = true)]
        delta: Decimal,
    },
    /// List a product's eligible lots in FIFO order
    Eligible {
        /// Product ID
        product_id: i32,
    },
    /// Expire every lot whose expiry date has passed
    Expire {
        /// Reference date (defaults to today)
        #[arg(long)]
        as_of: Option<NaiveDate>,
    },
}

#[derive(Subcommand)]
enum OrderAction {
    /// Create a draft order
    Create {
        /// Order number
        order_number: String,

        /// Line as `product_id:quantity` (repeatable)
        #[arg(short, long = "line", value_parser = parse_line, required = true)]
        lines: Vec<CreateOrderItemInput>,
    },
    /// Show an order with per-item pick progress
    Show {
        /// Order ID
        order_id: i32,
    },
}

fn split_pair(raw: &str) -> Result<(i32, Decimal), String> {
    let (id, quantity) = raw
        .split_once(':')
        .ok_or_else(|| format!("expected `id:quantity`, got '{raw}'"))?;
    let id = id
        .trim()
        .parse::<i32>()
        .map_err(|e| format!("invalid id '{id}': {e}"))?;
    let quantity = quantity
        .trim()
        .parse::<Decimal>()
        .map_err(|e| format!("invalid quantity '{quantity}': {e}"))?;
    Ok((id, quantity))
}

fn parse_source(raw: &str) -> Result<ConversionSource, String> {
    let (lot_id, quantity) = split_pair(raw)?;
    Ok(ConversionSource {
        lot_id: lotkeeper_core::InventoryLotId::new(lot_id),
        quantity,
    })
}

fn parse_line(raw: &str) -> Result<CreateOrderItemInput, String> {
    let (product_id, quantity_ordered) = split_pair(raw)?;
    Ok(CreateOrderItemInput {
        product_id: lotkeeper_core::ProductId::new(product_id),
        quantity_ordered,
    })
}

/// Initialize Sentry error tracking and return guard that must be kept alive.
fn init_sentry(config: &WarehouseConfig) -> Option<sentry::ClientInitGuard> {
    let dsn = config.sentry_dsn.as_ref()?;

    let guard = sentry::init((
        dsn.as_str(),
        sentry::ClientOptions {
            release: sentry::release_name!(),
            environment: config
                .sentry_environment
                .clone()
                .map(std::borrow::Cow::Owned),
            attach_stacktrace: true,
            ..Default::default()
        },
    ));

    Some(guard)
}

/// Filter tracing events to Sentry event types.
fn sentry_event_filter(metadata: &tracing::Metadata<'_>) -> sentry_tracing::EventFilter {
    match *metadata.level() {
        tracing::Level::ERROR => sentry_tracing::EventFilter::Event,
        tracing::Level::WARN | tracing::Level::INFO => sentry_tracing::EventFilter::Breadcrumb,
        _ => sentry_tracing::EventFilter::Ignore,
    }
}

fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "lotkeeper_warehouse=info,lotkeeper_cli=info,audit=info".into());

    // JSON lines for log shippers, text for terminals; both on stderr so stdout stays parseable
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let json_layer = json.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_writer(std::io::stderr)
    });
    let text_layer = (!json).then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(text_layer)
        .with(sentry_tracing::layer().event_filter(sentry_event_filter))
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match WarehouseConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            init_tracing();
            tracing::error!("Invalid configuration: {e}");
            std::process::exit(2);
        }
    };

    let sentry_guard = init_sentry(&config);
    init_tracing();

    let result = run(cli, config).await;

    if let Err(e) = result {
        tracing::error!("Command failed: {e}");
        drop(sentry_guard);
        std::process::exit(1);
    }
}

async fn run(cli: Cli, config: WarehouseConfig) -> Result<(), CliError> {
    let ctx = commands::Context::connect(config, cli.actor, cli.format).await?;
    match cli.command {
        Commands::Migrate => commands::migrate::run(&ctx).await,
        Commands::Receive {
            lot_number,
            product,
            quantity,
            unit,
            received,
            expiry,
            origin,
            qc,
        } => {
            commands::lots::receive(
                &ctx,
                commands::lots::ReceiveArgs {
                    lot_number,
                    product,
                    quantity,
                    unit,
                    received,
                    expiry,
                    origin,
                    qc,
                },
            )
            .await
        }
        Commands::Lot { action } => match action {
            LotAction::Show { lot } => commands::lots::show(&ctx, &lot).await,
            LotAction::Status { lot_id, status } => {
                commands::lots::set_status(&ctx, lot_id, status).await
            }
            LotAction::Adjust { lot_id, delta } => commands::lots::adjust(&ctx, lot_id, delta).await,
            LotAction::Eligible { product_id } => commands::lots::eligible(&ctx, product_id).await,
            LotAction::Expire { as_of } => commands::lots::expire(&ctx, as_of).await,
        },
        Commands::Order { action } => match action {
            OrderAction::Create {
                order_number,
                lines,
            } => commands::orders::create(&ctx, order_number, lines).await,
            OrderAction::Show { order_id } => commands::orders::show(&ctx, order_id).await,
        },
        Commands::Allocate { order_id } => commands::orders::allocate(&ctx, order_id).await,
        Commands::Deallocate { order_id } => commands::orders::deallocate(&ctx, order_id).await,
        Commands::Pick {
            item_id,
            lot_id,
            quantity,
        } => commands::orders::pick(&ctx, item_id, lot_id, quantity).await,
        Commands::Unpick { pick_id } => commands::orders::unpick(&ctx, pick_id).await,
        Commands::Ready { order_id } => commands::orders::ready(&ctx, order_id).await,
        Commands::Ship { order_id } => commands::orders::ship(&ctx, order_id).await,
        Commands::Unship { order_id } => commands::orders::unship(&ctx, order_id).await,
        Commands::Convert {
            sources,
            product,
            quantity,
            unit,
            lot_number,
            expiry,
            plan,
        } => {
            let input = match plan {
                Some(path) => commands::production::load_plan(&path)?,
                None => commands::production::input_from_args(
                    sources, product, quantity, unit, lot_number, expiry,
                )?,
            };
            commands::production::convert(&ctx, input).await
        }
        Commands::Lineage { lot_id } => commands::trace::lineage(&ctx, lot_id).await,
        Commands::Trace {
            lot_id,
            direction,
            max_depth,
        } => commands::trace::trace(&ctx, lot_id, direction, max_depth).await,
        Commands::Recall {
            lot,
            order,
            max_depth,
        } => commands::trace::recall(&ctx, lot, order, max_depth).await,
    }
}
