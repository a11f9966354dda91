//! optfeed-schema: Typed option quote records
//!
//! One strongly-typed `QuoteRecord` per option snapshot, the venue symbol
//! grammar (`BASE-EXPIRY-STRIKE-SIDE[-SETTLE]`), and the read filter used by
//! store consumers.

pub mod filter;
pub mod quote;
pub mod symbol;

pub use filter::{QuoteFilter, DEFAULT_READ_LIMIT};
pub use quote::{OptionSide, QuoteRecord};
pub use symbol::{expiry_date, normalize_symbol, sort_expiries, OptionSymbol, SymbolError};
