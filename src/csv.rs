use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use thiserror::Error;

use crate::engine::{Command, Engine, GatewayOutcome, OrderAction};
use crate::model::{
    AccountStatus, Actor, Context, DeliveryDetails, DeliveryMethod, NewProduct, Resolution, Role,
    UserId,
};
use crate::{Amount, Quantity};

/// Errors that can occur when reading a script
#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("failed to open script: {0}")]
    Open(#[source] csv::Error),

    #[error("line {line}: failed to parse row: {source}")]
    Parse { line: usize, source: csv::Error },

    #[error("line {line}: unrecognized row type '{kind}'")]
    UnrecognizedType { line: usize, kind: String },

    #[error("line {line}: {kind} missing {field}")]
    MissingField {
        line: usize,
        kind: String,
        field: &'static str,
    },

    #[error("line {line}: invalid {field} '{value}'")]
    InvalidField {
        line: usize,
        field: &'static str,
        value: String,
    },
}

/// One script row, ready for the engine.
#[derive(Debug, Clone)]
pub struct ScriptStep {
    pub line: usize,
    pub ctx: Context,
    pub command: Command,
}

#[derive(Debug, Deserialize)]
struct InputRow {
    r#type: String,
    actor: Option<UserId>,
    role: Option<String>,
    target: Option<u32>,
    quantity: Option<f64>,
    min_quantity: Option<f64>,
    amount: Option<f64>,
    reference: Option<String>,
    text: Option<String>,
    at: Option<String>,
}

#[derive(Debug, Serialize)]
struct OutputRow {
    order: u32,
    number: String,
    status: String,
    payment: String,
    subtotal: String,
    platform_fee: String,
    delivery_fee: String,
    total: String,
    captured: String,
    released: String,
    refunded: String,
    held: String,
}

/// Read a marketplace script from a csv file
pub fn read_script(
    path: impl AsRef<Path>,
) -> Result<impl Iterator<Item = Result<ScriptStep, ScriptError>>, ScriptError> {
    let reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(ScriptError::Open)?;

    Ok(reader
        .into_deserialize::<InputRow>()
        .enumerate()
        .map(|(idx, result)| {
            let line = idx + 2; // 1-indexed, skip header
            let row = result.map_err(|source| ScriptError::Parse { line, source })?;
            parse_row(line, row)
        }))
}

fn parse_row(line: usize, row: InputRow) -> Result<ScriptStep, ScriptError> {
    let kind = row.r#type.to_ascii_lowercase();
    let missing = |field: &'static str| ScriptError::MissingField {
        line,
        kind: kind.clone(),
        field,
    };
    let target = || row.target.ok_or_else(|| missing("target"));
    let quantity_of = |field: &'static str, value: f64| {
        Quantity::try_from_float(value).ok_or_else(|| invalid(line, field, &value.to_string()))
    };
    let quantity = || quantity_of("quantity", row.quantity.ok_or_else(|| missing("quantity"))?);
    let amount_of = |value: f64| {
        Amount::try_from_float(value).ok_or_else(|| invalid(line, "amount", &value.to_string()))
    };
    let amount = || amount_of(row.amount.ok_or_else(|| missing("amount"))?);
    let text = || row.text.clone().unwrap_or_default();

    let (default_role, command) = match kind.as_str() {
        "product" => (
            Role::Seller,
            Command::UpsertProduct(NewProduct {
                id: target()?,
                name: row.text.clone().ok_or_else(|| missing("text"))?,
                unit: row.reference.clone().unwrap_or_else(|| "unit".to_string()),
                unit_price: amount()?,
                stock: quantity()?,
                min_order: match row.min_quantity {
                    Some(value) => quantity_of("min_quantity", value)?,
                    None => Quantity::ZERO,
                },
                listed: true,
            }),
        ),
        "add" => (
            Role::Buyer,
            Command::AddItem {
                product: target()?,
                quantity: quantity()?,
            },
        ),
        "update" => (
            Role::Buyer,
            Command::UpdateItem {
                item: target()?,
                quantity: quantity()?,
            },
        ),
        "remove" => (Role::Buyer, Command::RemoveItem { item: target()? }),
        "clear" => (Role::Buyer, Command::ClearCart),
        "checkout" => {
            let method = match row.reference.as_deref() {
                None => DeliveryMethod::Delivery,
                Some(value) => {
                    DeliveryMethod::parse(value).ok_or_else(|| invalid(line, "reference", value))?
                }
            };
            let delivery = match method {
                DeliveryMethod::Pickup => DeliveryDetails::pickup(),
                DeliveryMethod::Delivery => DeliveryDetails {
                    address: row.text.clone(),
                    ..DeliveryDetails::delivery("")
                },
            };
            (Role::Buyer, Command::Checkout(delivery))
        }
        "pay" => {
            let reference = row.reference.clone().ok_or_else(|| missing("reference"))?;
            let outcome = match text().as_str() {
                "pending" => GatewayOutcome::Pending,
                "" | "success" => GatewayOutcome::Success { amount: amount()? },
                reason => GatewayOutcome::Failed {
                    reason: reason.to_string(),
                },
            };
            (
                Role::PaymentGateway,
                Command::VerifyPayment { reference, outcome },
            )
        }
        "process" => transition(Role::Seller, target()?, OrderAction::StartProcessing),
        "ship" => transition(
            Role::Seller,
            target()?,
            OrderAction::Ship {
                tracking: row.reference.clone(),
            },
        ),
        "deliver" => transition(Role::Seller, target()?, OrderAction::MarkDelivered),
        "confirm" => transition(Role::Buyer, target()?, OrderAction::ConfirmDelivery),
        "cancel" => transition(
            Role::Buyer,
            target()?,
            OrderAction::Cancel { reason: text() },
        ),
        "dispute" => (
            Role::Buyer,
            Command::OpenDispute {
                order: target()?,
                reason: text(),
                evidence: row.reference.iter().cloned().collect(),
            },
        ),
        "respond" => (
            Role::Seller,
            Command::RespondDispute {
                dispute: target()?,
                response: text(),
            },
        ),
        "resolve" => {
            let value = row.reference.as_deref().ok_or_else(|| missing("reference"))?;
            let resolution =
                Resolution::parse(value).ok_or_else(|| invalid(line, "reference", value))?;
            (
                Role::Admin,
                Command::ResolveDispute {
                    dispute: target()?,
                    resolution,
                    notes: text(),
                    partial_amount: row.amount.map(amount_of).transpose()?,
                },
            )
        }
        "withdraw" => (Role::Buyer, Command::WithdrawDispute { dispute: target()? }),
        "suspend" => (
            Role::Admin,
            Command::SetUserStatus {
                user: target()?,
                status: AccountStatus::Suspended,
            },
        ),
        "activate" => (
            Role::Admin,
            Command::SetUserStatus {
                user: target()?,
                status: AccountStatus::Active,
            },
        ),
        "verify" => (Role::Admin, Command::VerifyUser { user: target()? }),
        "setting" => (
            Role::Admin,
            Command::UpdateSetting {
                key: row.reference.clone().ok_or_else(|| missing("reference"))?,
                value: text(),
            },
        ),
        "sweep" => (Role::System, Command::Sweep),
        _ => {
            return Err(ScriptError::UnrecognizedType {
                line,
                kind: row.r#type.clone(),
            });
        }
    };

    let role = match row.role.as_deref() {
        None => default_role,
        Some(value) => parse_role(value).ok_or_else(|| invalid(line, "role", value))?,
    };
    let now = match row.at.as_deref() {
        None => Utc::now(),
        Some(value) => DateTime::parse_from_rfc3339(value)
            .map_err(|_| invalid(line, "at", value))?
            .with_timezone(&Utc),
    };

    Ok(ScriptStep {
        line,
        ctx: Context::new(Actor::new(row.actor.unwrap_or(0), role), now),
        command,
    })
}

fn transition(role: Role, order: u32, action: OrderAction) -> (Role, Command) {
    (
        role,
        Command::Transition {
            order,
            action,
            expected_version: None,
        },
    )
}

fn parse_role(value: &str) -> Option<Role> {
    match value.to_ascii_lowercase().as_str() {
        "buyer" => Some(Role::Buyer),
        "seller" => Some(Role::Seller),
        "admin" => Some(Role::Admin),
        "system" => Some(Role::System),
        "gateway" | "payment_gateway" => Some(Role::PaymentGateway),
        _ => None,
    }
}

fn invalid(line: usize, field: &'static str, value: &str) -> ScriptError {
    ScriptError::InvalidField {
        line,
        field,
        value: value.to_string(),
    }
}

/// Write one row per order, with its escrow balances, in csv format
pub fn write_orders(writer: impl io::Write, engine: &Engine) -> Result<(), csv::Error> {
    let mut writer = csv::Writer::from_writer(writer);

    for order in engine.orders() {
        let escrow = engine.escrow(order.id);
        let balance = |amount: fn(&crate::engine::EscrowAccount) -> Amount| {
            escrow.map_or(Amount::ZERO, amount).to_string()
        };
        let row = OutputRow {
            order: order.id,
            number: order.number.clone(),
            status: order.status.to_string(),
            payment: order.payment_status.as_str().to_string(),
            subtotal: order.totals.subtotal().to_string(),
            platform_fee: order.totals.platform_fee().to_string(),
            delivery_fee: order.totals.delivery_fee().to_string(),
            total: order.totals.total().to_string(),
            captured: balance(|account| account.captured),
            released: balance(|account| account.released),
            refunded: balance(|account| account.refunded),
            held: balance(|account| account.held()),
        };
        writer.serialize(&row)?;
    }

    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Config;
    use crate::lifecycle::OrderStatus;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const HEADER: &str = "type,actor,role,target,quantity,min_quantity,amount,reference,text,at\n";

    fn write_csv(rows: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(HEADER.as_bytes()).unwrap();
        file.write_all(rows.as_bytes()).unwrap();
        file
    }

    fn read(rows: &str) -> Vec<Result<ScriptStep, ScriptError>> {
        let file = write_csv(rows);
        read_script(file.path()).unwrap().collect()
    }

    #[test]
    fn read_product() {
        let steps = read("product,20,,1,1000,50,3.20,kg,Maize,2026-03-01T09:00:00Z\n");
        let step = steps.into_iter().next().unwrap().unwrap();

        assert_eq!(step.line, 2);
        assert_eq!(step.ctx.actor, Actor::seller(20));
        assert_eq!(step.ctx.now.to_rfc3339(), "2026-03-01T09:00:00+00:00");
        let Command::UpsertProduct(listing) = step.command else {
            panic!("expected a listing");
        };
        assert_eq!(listing.id, 1);
        assert_eq!(listing.name, "Maize");
        assert_eq!(listing.unit, "kg");
        assert_eq!(listing.unit_price, Amount::from_float(3.20));
        assert_eq!(listing.stock, Quantity::from_units(1000));
        assert_eq!(listing.min_order, Quantity::from_units(50));
    }

    #[test]
    fn read_payment_outcomes() {
        let steps = read(
            "pay,,,,,,983,ESC-000001,,\n\
             pay,,,,,,,ESC-000001,pending,\n\
             pay,,,,,,,ESC-000001,card declined,\n",
        );
        let outcomes: Vec<_> = steps
            .into_iter()
            .map(|step| match step.unwrap().command {
                Command::VerifyPayment { outcome, .. } => outcome,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(
            outcomes,
            vec![
                GatewayOutcome::Success {
                    amount: Amount::from_units(983)
                },
                GatewayOutcome::Pending,
                GatewayOutcome::Failed {
                    reason: "card declined".into()
                },
            ]
        );
    }

    #[test]
    fn read_with_whitespace_and_role_override() {
        let steps = read("cancel, 1, admin, 4, , , , , wrong address ,\n");
        let step = steps[0].as_ref().unwrap();
        assert_eq!(step.ctx.actor, Actor::admin(1));
        let Command::Transition { order, action, .. } = &step.command else {
            panic!("expected a transition");
        };
        assert_eq!(*order, 4);
        assert_eq!(
            action,
            &OrderAction::Cancel {
                reason: "wrong address".into()
            }
        );
    }

    #[test]
    fn read_returns_error_for_unknown_type() {
        let steps = read("refund,1,,1,,,,,,\n");
        let err = steps[0].as_ref().unwrap_err();
        assert!(matches!(err, ScriptError::UnrecognizedType { line: 2, .. }));
    }

    #[test]
    fn read_returns_error_for_missing_fields() {
        let steps = read("add,10,,1,,,,,,\nresolve,1,,1,,,,,notes,\n");
        assert!(matches!(
            steps[0].as_ref().unwrap_err(),
            ScriptError::MissingField {
                line: 2,
                field: "quantity",
                ..
            }
        ));
        assert!(matches!(
            steps[1].as_ref().unwrap_err(),
            ScriptError::MissingField {
                line: 3,
                field: "reference",
                ..
            }
        ));
    }

    #[test]
    fn read_returns_error_for_invalid_fields() {
        let steps = read("add,10,wizard,1,5,,,,,\nadd,10,,1,5,,,,,yesterday\n");
        assert!(matches!(
            steps[0].as_ref().unwrap_err(),
            ScriptError::InvalidField { field: "role", .. }
        ));
        assert!(matches!(
            steps[1].as_ref().unwrap_err(),
            ScriptError::InvalidField { field: "at", .. }
        ));
    }

    #[test]
    fn read_rejects_unrepresentable_numbers() {
        let steps = read(
            "add,10,,1,1e30,,,,,\n\
             pay,,,,,,NaN,ESC-000001,,\n\
             product,20,,1,1000,inf,3.20,kg,Maize,\n\
             resolve,1,,1,,,-1e300,partial_refund,split,\n",
        );
        let fields: Vec<_> = steps
            .iter()
            .map(|step| match step {
                Err(ScriptError::InvalidField { field, .. }) => *field,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(fields, vec!["quantity", "amount", "min_quantity", "amount"]);
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(matches!(
            read_script("does/not/exist.csv"),
            Err(ScriptError::Open(_))
        ));
    }

    #[test]
    fn script_drives_the_engine_and_writes_orders() {
        let file = write_csv(
            "product,20,,1,1000,50,3.20,kg,Maize,2026-03-01T09:00:00Z\n\
             product,20,,2,200,10,11.60,crate,Tomatoes,2026-03-01T09:00:00Z\n\
             add,10,,1,100,,,,,2026-03-01T10:00:00Z\n\
             add,10,,2,50,,,,,2026-03-01T10:01:00Z\n\
             checkout,10,,,,,,delivery,12 Market Rd,2026-03-01T10:05:00Z\n\
             pay,,,,,,983,ESC-000001,,2026-03-01T10:06:00Z\n",
        );
        let mut engine = Engine::new(Config::default());
        for step in read_script(file.path()).unwrap() {
            let step = step.unwrap();
            engine.apply(&step.ctx, step.command).unwrap();
        }
        assert_eq!(engine.order(1).unwrap().status, OrderStatus::Paid);

        let mut out = Vec::new();
        write_orders(&mut out, &engine).unwrap();
        let out = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(
            lines[0],
            "order,number,status,payment,subtotal,platform_fee,delivery_fee,total,captured,released,refunded,held"
        );
        assert_eq!(
            lines[1],
            "1,ORD-20260301100500-0001,PAID,PAID,900.0000,45.0000,38.0000,983.0000,983.0000,0.0000,0.0000,983.0000"
        );
    }
}
