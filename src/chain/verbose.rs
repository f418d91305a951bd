//! Decoding of verbose transaction JSON.
//!
//! Bitcoin Core (`getrawtransaction <txid> 2`) and Electrum servers
//! (`blockchain.transaction.get <txid> true`) both return the same verbose
//! layout. Values are BTC decimals and are converted to satoshis exactly.

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;

use super::ProviderError;
use crate::types::{ScriptType, Transaction, TxInput, TxOutput, NULL_TXID};

const SATS_PER_BTC: Decimal = dec!(100_000_000);

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct VerboseTx {
    pub txid: String,
    #[serde(default)]
    pub vin: Vec<VerboseVin>,
    #[serde(default)]
    pub vout: Vec<VerboseVout>,
    #[serde(default)]
    pub blocktime: Option<i64>,
    #[serde(default)]
    pub time: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct VerboseVin {
    #[serde(default)]
    pub txid: Option<String>,
    #[serde(default)]
    pub vout: Option<u32>,
    #[serde(default)]
    pub coinbase: Option<String>,
    #[serde(default)]
    pub prevout: Option<VerbosePrevout>,
}

#[derive(Debug, Deserialize)]
pub struct VerbosePrevout {
    pub value: Decimal,
    #[serde(rename = "scriptPubKey")]
    pub script_pub_key: VerboseScript,
}

#[derive(Debug, Deserialize)]
pub struct VerboseVout {
    pub value: Decimal,
    pub n: u32,
    #[serde(rename = "scriptPubKey")]
    pub script_pub_key: VerboseScript,
}

#[derive(Debug, Default, Deserialize)]
pub struct VerboseScript {
    #[serde(default)]
    pub hex: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    /// Pre-0.21 nodes report a list instead of a single address.
    #[serde(default)]
    pub addresses: Vec<String>,
}

impl VerboseScript {
    fn address(&self) -> Option<String> {
        self.address
            .clone()
            .or_else(|| self.addresses.first().cloned())
    }

    fn script_type(&self) -> ScriptType {
        let by_name = self
            .kind
            .as_deref()
            .map(ScriptType::from_rpc_name)
            .unwrap_or_default();
        if by_name != ScriptType::Unknown {
            return by_name;
        }
        if let Some(hex) = &self.hex {
            let by_hex = ScriptType::from_script_hex(hex);
            if by_hex != ScriptType::Unknown {
                return by_hex;
            }
        }
        self.address()
            .map(|a| ScriptType::from_address(&a))
            .unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Conversion
// ---------------------------------------------------------------------------

/// Convert a BTC amount to satoshis.
pub fn btc_to_sats(value: Decimal) -> Result<u64, ProviderError> {
    (value.round_dp(8) * SATS_PER_BTC)
        .to_u64()
        .ok_or_else(|| ProviderError::Unavailable(format!("invalid output value {value}")))
}

fn timestamp(secs: Option<i64>) -> Option<DateTime<Utc>> {
    secs.and_then(|s| Utc.timestamp_opt(s, 0).single())
}

impl VerboseTx {
    pub fn into_transaction(self) -> Result<Transaction, ProviderError> {
        let mut inputs = Vec::with_capacity(self.vin.len());
        for vin in self.vin {
            if vin.coinbase.is_some() {
                inputs.push(TxInput::new(NULL_TXID, u32::MAX));
                continue;
            }
            let (Some(txid), Some(vout)) = (vin.txid, vin.vout) else {
                return Err(ProviderError::Unavailable(format!(
                    "malformed input in transaction {}",
                    self.txid
                )));
            };
            let mut input = TxInput::new(txid.to_lowercase(), vout);
            if let Some(prevout) = vin.prevout {
                input.prev_value = Some(btc_to_sats(prevout.value)?);
                input.prev_script_type = Some(prevout.script_pub_key.script_type());
                input.prev_address = prevout.script_pub_key.address();
            }
            inputs.push(input);
        }

        let outputs = self
            .vout
            .into_iter()
            .map(|vout| {
                Ok(TxOutput {
                    index: vout.n,
                    value: btc_to_sats(vout.value)?,
                    address: vout.script_pub_key.address(),
                    script_type: vout.script_pub_key.script_type(),
                })
            })
            .collect::<Result<Vec<_>, ProviderError>>()?;

        Ok(Transaction {
            txid: self.txid.to_lowercase(),
            inputs,
            outputs,
            block_time: timestamp(self.blocktime.or(self.time)),
        })
    }
}

/// Decode a verbose transaction from a JSON-RPC `result` value.
pub fn decode(value: serde_json::Value) -> Result<Transaction, ProviderError> {
    let tx: VerboseTx = serde_json::from_value(value)
        .map_err(|e| ProviderError::Unavailable(format!("malformed transaction JSON: {e}")))?;
    tx.into_transaction()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
