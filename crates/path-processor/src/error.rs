use flex_error::define_error;

use crate::ident::ChainId;
use crate::provider::ProviderError;

define_error! {
    Error {
        NoChainProvider
            { chain_id: ChainId }
            |e| { format!("no chain provider set for chain {}", e.chain_id) },

        MissingHeader
            { chain_id: ChainId, height: u64 }
            |e| {
                format!(
                    "no cached header for chain {} at height {}",
                    e.chain_id, e.height
                )
            },

        InitialMessage
            { chain_id: ChainId, action: String }
            [ ProviderError ]
            |e| {
                format!(
                    "failed to submit initial {} to chain {}",
                    e.action, e.chain_id
                )
            },

        UpdateClient
            { chain_id: ChainId }
            [ ProviderError ]
            |e| { format!("failed to build client update for chain {}", e.chain_id) },

        Send
            { chain_id: ChainId, count: usize }
            [ ProviderError ]
            |e| {
                format!(
                    "failed to broadcast {} messages to chain {}",
                    e.count, e.chain_id
                )
            },
    }
}
