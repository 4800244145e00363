//! Channel session core: keeps one viewer's message list and reaction
//! tallies consistent while history pages, optimistic local writes and push
//! events arrive in no particular order.

pub mod aggregator;
pub mod backend;
pub mod config;
pub mod controller;
pub mod error;
pub mod merger;
pub mod overlay;
pub mod router;
pub mod session;
pub mod view;

pub use backend::{ChatBackend, EmptyRoster, MemberRoster, PushTransport, Subscription};
pub use config::SessionConfig;
pub use controller::{ChannelController, ChannelSession, Draft, SessionState};
pub use error::{BackendError, SessionError};
pub use session::{ChannelSwitcher, Collaborators, SessionHandle};
pub use view::ChannelSessionView;
