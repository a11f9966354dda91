use optfeed_schema::QuoteRecord;

/// One decoded inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    /// Ticker data, zero or more records
    Quotes(Vec<QuoteRecord>),
    /// Reply to a subscribe/unsubscribe request
    Ack(SubscribeAck),
    /// Reply to an application-level ping
    Pong,
    /// Frame that could not be decoded; counted and discarded
    Malformed(String),
    /// Recognized frame with nothing to do
    Ignored,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubscribeAck {
    pub req_id: Option<String>,
    pub op: String,
    pub success: bool,
    pub ret_msg: String,
}
