mod forward;
mod relay;
mod state;

pub use state::{GatewayHttpState, OpenAiErrorResponse, router};
