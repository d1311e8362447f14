//! Typed request/reply layer on top of the raw letter socket.
//!
//! Messages self-serialize through [TypedMessage] and travel as two-part letters: part 0 is
//!  the eight-byte [MessageTypeId], part 1 the payload. Requests are correlated with their
//!  replies by the letter's id, tracked in a per-socket outstanding map; everything else is
//!  dispatched to the handlers registered for the message's type id.

mod answerable;
mod message;
mod typed_socket;

pub use answerable::Answerable;
pub use message::{MessageTypeId, TypedMessage};
pub use typed_socket::{DefaultHandlerFactory, HandlerFactory, TypedHandler, TypedSocket};
