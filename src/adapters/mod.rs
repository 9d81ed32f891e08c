pub mod lnd_rest;
pub mod postgres;
pub mod price_feed;
pub mod store;

pub use lnd_rest::{
    HeldInvoice, InvoiceState, LightningNode, LndRestClient, PaymentReceipt,
};
pub use postgres::PostgresStore;
pub use price_feed::PriceFeed;
pub use store::TradeStore;

#[cfg(test)]
pub use lnd_rest::MockLightningNode;
#[cfg(test)]
pub use store::MockTradeStore;
