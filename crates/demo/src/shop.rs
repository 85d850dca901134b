//! Cart and order streams used by the demo.

use serde::{Deserialize, Serialize};

use tidewater_core::{DomainError, DomainResult, PayloadError, StreamId};
use tidewater_events::{Command, Event, Reply, State, Stream};
use tidewater_infra::Pick;

pub const CART: &str = "cart";
pub const ORDER: &str = "order";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Line {
    pub sku: String,
    pub quantity: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemAdded {
    pub sku: String,
    pub quantity: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckedOut {
    pub order_id: StreamId,
    pub lines: Vec<Line>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderPlaced {
    pub cart_id: StreamId,
    pub lines: Vec<Line>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Cart {
    pub lines: Vec<Line>,
    pub checked_out: bool,
}

impl State for Cart {
    fn apply(&mut self, event: &Event) -> Result<(), PayloadError> {
        match event.name() {
            "cartOpened" => Ok(()),
            "itemAdded" => {
                let added: ItemAdded = event.decode()?;
                match self.lines.iter_mut().find(|l| l.sku == added.sku) {
                    Some(line) => line.quantity += added.quantity,
                    None => self.lines.push(Line {
                        sku: added.sku,
                        quantity: added.quantity,
                    }),
                }
                Ok(())
            }
            "checkedOut" => {
                self.checked_out = true;
                Ok(())
            }
            other => Err(PayloadError::unexpected(other)),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Order {
    pub cart_id: Option<StreamId>,
    pub lines: Vec<Line>,
}

impl Order {
    pub fn units(&self) -> u32 {
        self.lines.iter().map(|l| l.quantity).sum()
    }
}

impl State for Order {
    fn apply(&mut self, event: &Event) -> Result<(), PayloadError> {
        match event.name() {
            "orderPlaced" => {
                let placed: OrderPlaced = event.decode()?;
                self.cart_id = Some(placed.cart_id);
                self.lines = placed.lines;
                Ok(())
            }
            other => Err(PayloadError::unexpected(other)),
        }
    }
}

pub fn open_cart(stream: &mut Stream<Cart>, _: &Command) -> DomainResult<Option<Reply>> {
    stream.mutate("cartOpened", &serde_json::Value::Null)?;
    Ok(None)
}

pub fn add_item(stream: &mut Stream<Cart>, command: &Command) -> DomainResult<Option<Reply>> {
    let item: ItemAdded = command.decode()?;
    if stream.state().checked_out {
        return Err(DomainError::invariant("cart already checked out"));
    }
    if item.quantity == 0 {
        return Err(DomainError::validation("quantity must be positive"));
    }
    stream.mutate("itemAdded", &item)?;
    Ok(None)
}

pub fn check_out(stream: &mut Stream<Cart>, command: &Command) -> DomainResult<Option<Reply>> {
    if stream.state().checked_out {
        return Err(DomainError::invariant("cart already checked out"));
    }
    if stream.state().lines.is_empty() {
        return Err(DomainError::validation("cart is empty"));
    }
    let checked_out = CheckedOut {
        order_id: StreamId::new(),
        lines: stream.state().lines.clone(),
    };
    stream.mutate("checkedOut", &checked_out)?;
    Ok(Some(command.reply_ok(stream.version())))
}

pub fn pick_order(event: &Event) -> Pick {
    event
        .decode::<CheckedOut>()
        .map(|c| Pick::One(c.order_id))
        .unwrap_or_default()
}

pub fn place_order(stream: &mut Stream<Order>, event: &Event) -> DomainResult<()> {
    let checked_out: CheckedOut = event.decode()?;
    stream.mutate(
        "orderPlaced",
        &OrderPlaced {
            cart_id: event.stream_id(),
            lines: checked_out.lines,
        },
    )?;
    Ok(())
}
