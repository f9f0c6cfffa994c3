pub mod anthropic;
pub mod quantconnect;

pub use anthropic::AnthropicClient;
pub use quantconnect::QuantConnectClient;
