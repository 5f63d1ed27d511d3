//! Identifiers for the on-chain objects a path processor coordinates.
//!
//! All identifiers are thin wrappers over their on-chain string form. An
//! empty identifier is meaningful: counterparty identifiers are empty until
//! the counterparty chain assigns them during a handshake.

use core::convert::Infallible;
use core::fmt::{Display, Error as FmtError, Formatter};
use core::str::FromStr;

use serde::{Deserialize, Serialize};

macro_rules! identifier {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = Infallible;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_string()))
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

identifier! {
    /// Identifier of a chain, e.g. `cosmoshub-4`.
    ChainId
}

identifier! {
    /// Identifier of a light client hosted on a chain, e.g. `07-tendermint-3`.
    ClientId
}

identifier! {
    /// Identifier of a connection end, e.g. `connection-1`.
    ConnectionId
}

identifier! {
    /// Identifier of a channel end, e.g. `channel-0`.
    ChannelId
}

identifier! {
    /// Identifier of a port bound by an application, e.g. `transfer`.
    PortId
}
