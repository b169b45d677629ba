//! Domain entities shared by every node: the lobby advertisement, query
//! filters and the session role.
//!
//! Nothing in here touches a socket.

pub mod advertisement;
pub mod session;

pub use advertisement::{
    Advertisement, AdvertisementError, LobbyFilter, LobbyStatus, RESERVED_FIELDS,
};
pub use session::SessionRole;
