//! The minimal demo component `run-manager` registers so the CLI is
//! immediately useful for exercising the Echo scenario (SPEC_FULL.md §8)
//! without a second process providing one.

use async_trait::async_trait;
use conduit_component::Component;
use conduit_core::{message::kind, ControlPayload, Envelope, Error, Result};

static NO_INPUTS: [String; 0] = [];

pub struct Echo;

#[async_trait]
impl Component for Echo {
    fn declared_inputs(&self) -> &[String] {
        &NO_INPUTS
    }

    fn output_kind(&self) -> &str {
        kind::TEXT_MESSAGE
    }

    async fn on_request(&self, request: Envelope) -> Result<Envelope> {
        let ControlPayload::TextRequest { text } = request.decode_payload()? else {
            return Err(Error::MessageTypeRejected {
                kind: request.kind,
                component: "Echo".into(),
            });
        };
        Ok(Envelope::new(
            kind::TEXT_MESSAGE,
            serde_json::to_value(ControlPayload::TextMessage { text }).map_err(Error::Serde)?,
        ))
    }
}
