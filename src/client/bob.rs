use super::CoordinatorClient;
use crate::core::types::RoundId;
use crate::crypto::UnblindedSignature;
use crate::rpc::types::{ActiveOutput, OutputRequest};
use anyhow::Result;
use bitcoin::Address;

/// Output-side role. Holds its own connection, never an Alice id.
pub struct BobClient {
    client: CoordinatorClient,
}

impl BobClient {
    pub fn new(client: CoordinatorClient) -> Self {
        Self { client }
    }

    pub async fn post_output(
        &self,
        round_id: RoundId,
        address: &Address,
        signature: UnblindedSignature,
        level: usize,
    ) -> Result<()> {
        let request = OutputRequest {
            round_id,
            active_output: ActiveOutput { address: address.to_string(), signature, level },
        };
        self.client.post("/output", &request).await
    }
}
