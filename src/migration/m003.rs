//! Version 3: move users off the retired test RPC host.

use serde_json::Value;

use super::{Migration, MigrationError};
use crate::state::VersionedState;

const OLD_TEST_RPC: &str = "https://rawtestrpc.iTrust.io/";
const NEW_TEST_RPC: &str = "https://testrpc.iTrust.io/";

pub struct Migration003;

impl Migration for Migration003 {
    fn version(&self) -> u32 {
        3
    }

    fn migrate(&self, mut state: VersionedState) -> Result<VersionedState, MigrationError> {
        state.meta.version = self.version();

        let config = match state.data.get_mut("config") {
            None | Some(Value::Null) => return Ok(state),
            Some(Value::Object(config)) => config,
            Some(_) => return Err(malformed("data.config")),
        };
        let provider = match config.get_mut("provider") {
            None | Some(Value::Null) => return Ok(state),
            Some(Value::Object(provider)) => provider,
            Some(_) => return Err(malformed("data.config.provider")),
        };
        if provider.get("rpcTarget").and_then(Value::as_str) == Some(OLD_TEST_RPC) {
            provider.insert("rpcTarget".into(), Value::String(NEW_TEST_RPC.into()));
        }
        Ok(state)
    }
}

fn malformed(path: &str) -> MigrationError {
    MigrationError::Malformed {
        path: path.into(),
        reason: "expected an object".into(),
    }
}
