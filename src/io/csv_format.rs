//! CSV format handling for scenario records and ledger output
//!
//! This module centralizes all CSV format concerns, providing:
//! - ScenarioRecord structure for deserialization
//! - Conversion from scenario records to typed actions
//! - Transaction ledger serialization
//!
//! All functions are pure (no I/O) for easy testing.
//!
//! # Scenario format
//!
//! Columns `op,actor,subject,value`. `actor` is the calling user; `subject`
//! names the item or transaction the op applies to.
//!
//! | op             | actor    | subject     | value                      |
//! |----------------|----------|-------------|----------------------------|
//! | `user`         | user id  |             | flags: `payable`, `admin`, joined with `+` |
//! | `list`         | seller   | item id     | price                      |
//! | `request`      | buyer    | item id     |                            |
//! | `approve`      | seller   | tx id       |                            |
//! | `pay`          | buyer    | tx id       |                            |
//! | `meet`         | either   | tx id       | meeting place              |
//! | `handover`     | buyer    | tx id       |                            |
//! | `webhook`      |          | tx id       |                            |
//! | `cancel`       | either   | tx id       |                            |
//! | `admin_cancel` | operator | tx id       |                            |
//! | `rate`         | rater    | tx id       | `<role>:<score>`           |
//! | `advance`      |          |             | hours                      |
//! | `sweep`        |          |             |                            |

use std::io::Write;

use serde::Deserialize;

use crate::types::{EscrowError, ItemStatus, Role, Transaction};

/// CSV record structure for deserialization
///
/// Every column but `op` is optional because most ops only use some of them.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ScenarioRecord {
    pub op: String,
    pub actor: Option<String>,
    pub subject: Option<String>,
    pub value: Option<String>,
}

/// One marketplace action of a scenario
#[derive(Debug, Clone, PartialEq)]
pub enum ScenarioAction {
    User {
        id: String,
        payable: bool,
        admin: bool,
    },
    List {
        seller: String,
        item: String,
        price: i64,
    },
    Request {
        buyer: String,
        item: String,
    },
    Approve {
        seller: String,
        tx: String,
    },
    Pay {
        buyer: String,
        tx: String,
    },
    Meet {
        user: String,
        tx: String,
        place: String,
    },
    Handover {
        buyer: String,
        tx: String,
    },
    Webhook {
        tx: String,
    },
    Cancel {
        user: String,
        tx: String,
    },
    AdminCancel {
        operator: String,
        tx: String,
    },
    Rate {
        rater: String,
        tx: String,
        role: Role,
        score: u8,
    },
    Advance {
        hours: i64,
    },
    Sweep,
}

fn non_empty(field: Option<String>) -> Option<String> {
    field
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn required(field: Option<String>, name: &str, op: &str) -> Result<String, String> {
    non_empty(field).ok_or_else(|| format!("'{}' requires a {}", op, name))
}

fn parse_flags(value: Option<String>) -> Result<(bool, bool), String> {
    let mut payable = false;
    let mut admin = false;

    for flag in non_empty(value).unwrap_or_default().split('+') {
        match flag.trim().to_lowercase().as_str() {
            "" => {}
            "payable" => payable = true,
            "admin" => admin = true,
            other => return Err(format!("Unknown user flag '{}'", other)),
        }
    }

    Ok((payable, admin))
}

fn parse_rating(value: Option<String>) -> Result<(Role, u8), String> {
    let value = required(value, "'<role>:<score>' value", "rate")?;
    let (role, score) = value
        .split_once(':')
        .ok_or_else(|| format!("Invalid rating '{}', expected '<role>:<score>'", value))?;

    let role = match role.trim().to_lowercase().as_str() {
        "buyer" => Role::Buyer,
        "seller" => Role::Seller,
        other => return Err(format!("Invalid role '{}'", other)),
    };
    let score = score
        .trim()
        .parse::<u8>()
        .map_err(|_| format!("Invalid score '{}'", score.trim()))?;

    Ok((role, score))
}

/// Convert a ScenarioRecord to a ScenarioAction
///
/// Validates that the columns the op needs are present and well-formed.
/// Business rules (score range, prices, permissions) are left to the
/// orchestrator.
///
/// # Returns
///
/// * `Ok(ScenarioAction)` - Successfully converted record
/// * `Err(String)` - Error message describing the conversion failure
pub fn convert_scenario_record(record: ScenarioRecord) -> Result<ScenarioAction, String> {
    let op = record.op.trim().to_lowercase();
    let op = op.as_str();

    let action = match op {
        "user" => {
            let (payable, admin) = parse_flags(record.value)?;
            ScenarioAction::User {
                id: required(record.actor, "actor", op)?,
                payable,
                admin,
            }
        }
        "list" => {
            let price = required(record.value, "price", op)?;
            ScenarioAction::List {
                seller: required(record.actor, "actor", op)?,
                item: required(record.subject, "item id", op)?,
                price: price
                    .parse::<i64>()
                    .map_err(|_| format!("Invalid price '{}'", price))?,
            }
        }
        "request" => ScenarioAction::Request {
            buyer: required(record.actor, "actor", op)?,
            item: required(record.subject, "item id", op)?,
        },
        "approve" => ScenarioAction::Approve {
            seller: required(record.actor, "actor", op)?,
            tx: required(record.subject, "transaction id", op)?,
        },
        "pay" => ScenarioAction::Pay {
            buyer: required(record.actor, "actor", op)?,
            tx: required(record.subject, "transaction id", op)?,
        },
        "meet" => ScenarioAction::Meet {
            user: required(record.actor, "actor", op)?,
            tx: required(record.subject, "transaction id", op)?,
            place: required(record.value, "meeting place", op)?,
        },
        "handover" => ScenarioAction::Handover {
            buyer: required(record.actor, "actor", op)?,
            tx: required(record.subject, "transaction id", op)?,
        },
        "webhook" => ScenarioAction::Webhook {
            tx: required(record.subject, "transaction id", op)?,
        },
        "cancel" => ScenarioAction::Cancel {
            user: required(record.actor, "actor", op)?,
            tx: required(record.subject, "transaction id", op)?,
        },
        "admin_cancel" => ScenarioAction::AdminCancel {
            operator: required(record.actor, "actor", op)?,
            tx: required(record.subject, "transaction id", op)?,
        },
        "rate" => {
            let (role, score) = parse_rating(record.value)?;
            ScenarioAction::Rate {
                rater: required(record.actor, "actor", op)?,
                tx: required(record.subject, "transaction id", op)?,
                role,
                score,
            }
        }
        "advance" => {
            let hours = required(record.value, "number of hours", op)?;
            ScenarioAction::Advance {
                hours: hours
                    .parse::<i64>()
                    .ok()
                    .filter(|h| *h >= 0)
                    .ok_or_else(|| format!("Invalid number of hours '{}'", hours))?,
            }
        }
        "sweep" => ScenarioAction::Sweep,
        _ => return Err(format!("Invalid op: '{}'", record.op)),
    };

    Ok(action)
}

/// One output row: a transaction joined with its item's status
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerRow {
    pub transaction: Transaction,
    pub item_status: ItemStatus,
}

/// Write the transaction ledger in CSV format
///
/// Columns: tx, item, buyer, seller, status, item_status, fee, intent,
/// unlocked, buyer_rated, seller_rated. Rows are sorted by transaction id,
/// comparing a trailing `-N` as a number, for deterministic output; absent
/// fee and intent are written empty.
pub fn write_transactions_csv(rows: &[LedgerRow], output: &mut dyn Write) -> Result<(), EscrowError> {
    let mut writer = csv::Writer::from_writer(output);

    writer.write_record([
        "tx",
        "item",
        "buyer",
        "seller",
        "status",
        "item_status",
        "fee",
        "intent",
        "unlocked",
        "buyer_rated",
        "seller_rated",
    ])?;

    let mut sorted: Vec<&LedgerRow> = rows.iter().collect();
    sorted.sort_by(|a, b| ledger_key(&a.transaction.id).cmp(&ledger_key(&b.transaction.id)));

    for row in sorted {
        let tx = &row.transaction;
        writer.write_record(&[
            tx.id.clone(),
            tx.item_id.clone(),
            tx.buyer_id.clone(),
            tx.seller_id.clone(),
            tx.status.as_str().to_string(),
            row.item_status.as_str().to_string(),
            tx.fee_amount.map(|fee| fee.to_string()).unwrap_or_default(),
            tx.payment_intent_id.clone().unwrap_or_default(),
            tx.unlocked_assets.is_some().to_string(),
            tx.buyer_rated.to_string(),
            tx.seller_rated.to_string(),
        ])?;
    }

    writer.flush()?;
    Ok(())
}

/// Sort key placing `tx-2` before `tx-10`; ids without a numeric suffix sort by text
fn ledger_key(id: &str) -> (&str, Option<u64>, &str) {
    match id.rsplit_once('-') {
        Some((prefix, suffix)) => match suffix.parse::<u64>() {
            Ok(n) => (prefix, Some(n), id),
            Err(_) => (id, None, id),
        },
        None => (id, None, id),
    }
}
