pub mod binance_futures;
pub mod postgres;
pub mod telegram;

pub use binance_futures::{BinanceFuturesClient, BINANCE_FUTURES_URL};
pub use postgres::PostgresFundingStore;
pub use telegram::TelegramNotifier;
