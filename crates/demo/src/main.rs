//! Cart checkout wired through two engines, the partitioned bus and a relay per storage.

mod shop;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use serde_json::json;

use tidewater_core::StreamId;
use tidewater_events::{Command, Context, Event, EventHandler, PartitionedBus, Projection};
use tidewater_infra::{
    command_fn, event_fn, CommandSink, InMemoryStorage, Logged, Mutator, Outbox, OutboxRelay,
    RelayConfig, Settings, SinkHandler, Storage,
};
use tokio::task::JoinHandle;

use shop::{CART, Cart, ItemAdded, ORDER, Order};

/// Redeliver `outbox` batches onto the bus until `ctx` is cancelled.
fn spawn_relay<O>(
    outbox: O,
    bus: Arc<PartitionedBus>,
    config: RelayConfig,
    ctx: &Context,
) -> JoinHandle<()>
where
    O: Outbox + 'static,
{
    let relay = OutboxRelay::new(outbox, bus, config);
    let ctx = ctx.clone();
    tokio::spawn(async move { relay.run(&ctx).await })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tidewater_observability::init();

    let settings = Settings::from_env().context("invalid TIDEWATER_* configuration")?;
    let policy = settings.engine.version_policy();

    let bus = Arc::new(PartitionedBus::new(settings.bus)?);
    let carts = Arc::new(InMemoryStorage::<Cart>::new(CART)?.with_policy(policy));
    let orders = Arc::new(InMemoryStorage::<Order>::new(ORDER)?.with_policy(policy));

    let cart_engine = Logged::labelled(
        Mutator::builder(carts.clone(), bus.clone())
            .with_config(&settings.engine)
            .command_create("openCart", command_fn(shop::open_cart))
            .command("addItem", command_fn(shop::add_item))
            .command("checkOut", command_fn(shop::check_out))
            .build()?,
        "cart",
    );

    let order_engine = Arc::new(Logged::labelled(
        Mutator::builder(orders.clone(), bus.clone())
            .with_config(&settings.engine)
            .ignore_events(["orderPlaced"])
            .event_create("checkedOut", event_fn(shop::pick_order, shop::place_order))
            .build()?,
        "order",
    ));

    bus.subscribe(
        CART,
        [Arc::new(SinkHandler::new(order_engine.clone()).on(["checkedOut"]))
            as Arc<dyn EventHandler>],
    )?;
    bus.subscribe(
        ORDER,
        [Arc::new(Logged::labelled(
            Projection::new().on("orderPlaced", |event: &Event| {
                let placed: shop::OrderPlaced = event.decode()?;
                tracing::info!(
                    order_id = %event.stream_id(),
                    cart_id = %placed.cart_id,
                    lines = placed.lines.len(),
                    "order placed"
                );
                Ok(())
            }),
            "order-feed",
        )) as Arc<dyn EventHandler>],
    )?;

    let (ctx, cancel) = Context::with_cancel();
    let listener = {
        let bus = bus.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move { bus.listen(&ctx).await })
    };
    let cart_relay = spawn_relay(carts.clone(), bus.clone(), settings.relay, &ctx);
    let order_relay = spawn_relay(orders.clone(), bus.clone(), settings.relay, &ctx);
    while !bus.is_listening() {
        tokio::task::yield_now().await;
    }

    let cart_id = StreamId::new();
    let open = Command::new("openCart", CART, json!(null)).with_stream_id(cart_id);
    let reply = cart_engine.handle_command(&ctx, &open).await?;
    tracing::info!(cart_id = %cart_id, version = reply.version(), "cart opened");

    for (sku, quantity) in [("kettle", 1), ("mug", 2), ("mug", 2)] {
        let add = Command::from_typed(
            "addItem",
            CART,
            &ItemAdded {
                sku: sku.to_string(),
                quantity,
            },
        )?
        .with_stream_id(cart_id);
        cart_engine.handle_command(&ctx, &add).await?;
    }

    let checkout = Command::new("checkOut", CART, json!(null)).with_stream_id(cart_id);
    let reply = cart_engine.handle_command(&ctx, &checkout).await?;
    tracing::info!(version = reply.version(), "cart checked out");

    let again = Command::new("checkOut", CART, json!(null)).with_stream_id(cart_id);
    if let Err(err) = cart_engine.handle_command(&ctx, &again).await {
        tracing::info!(error = %err, "second checkout rejected");
    }

    tokio::time::sleep(Duration::from_millis(100)).await;

    let cart = carts.load(&ctx, cart_id, None).await?;
    tracing::info!(
        cart_id = %cart.id(),
        version = cart.previous_version(),
        lines = cart.state().lines.len(),
        "final cart"
    );
    for id in orders.ids()? {
        let order = orders.load(&ctx, id, None).await?;
        tracing::info!(order_id = %id, units = order.state().units(), "final order");
    }

    cancel.cancel();
    bus.close().await;
    listener.await??;
    cart_relay.await?;
    order_relay.await?;
    Ok(())
}
