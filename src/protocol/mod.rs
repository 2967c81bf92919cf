//! Agent 间消息协议：信封、结构校验、优先队列

pub mod envelope;
pub mod queue;
pub mod validator;

pub use envelope::{
    create_error_response, create_message, create_success_response, generate_session_id,
    preserve_context, Action, ChainEntry, Envelope, MessageContext, Payload,
};
pub use queue::MessageQueue;
pub use validator::{parse_envelope, validate_message, validate_value, Validation};
