use chrono::{DateTime, NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tempfile::NamedTempFile;

use crate::error::LedgerError;

/// Column order of the ledger file
pub const COLUMNS: [&str; 7] = [
    "id",
    "buy_price",
    "amount",
    "remaining_amount",
    "sold",
    "half_sold",
    "buy_timestamp",
];

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LotState {
    Open,
    HalfSold,
    Closed,
}

/// One recorded purchase and how much of it is still held
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuyLot {
    pub id: u32,
    #[serde(deserialize_with = "decimal_field")]
    pub buy_price: Decimal,
    #[serde(deserialize_with = "decimal_field")]
    pub amount: Decimal,
    #[serde(deserialize_with = "decimal_field")]
    pub remaining_amount: Decimal,
    #[serde(deserialize_with = "flag_field")]
    pub sold: bool,
    #[serde(deserialize_with = "flag_field")]
    pub half_sold: bool,
    #[serde(
        serialize_with = "serialize_timestamp",
        deserialize_with = "timestamp_field"
    )]
    pub buy_timestamp: NaiveDateTime,
}

impl BuyLot {
    pub fn state(&self) -> LotState {
        if self.sold {
            LotState::Closed
        } else if self.half_sold {
            LotState::HalfSold
        } else {
            LotState::Open
        }
    }

    /// True while the lot still has coins that can be sold
    pub fn is_open(&self) -> bool {
        !self.sold && self.remaining_amount > Decimal::ZERO
    }

    /// Current price over buy price
    pub fn ratio(&self, current_price: Decimal) -> Decimal {
        if self.buy_price.is_zero() {
            return Decimal::ZERO;
        }
        current_price / self.buy_price
    }

    fn check_invariants(&self) -> Result<(), String> {
        if self.amount <= Decimal::ZERO {
            return Err(format!("amount {} is not positive", self.amount));
        }
        if self.remaining_amount < Decimal::ZERO || self.remaining_amount > self.amount {
            return Err(format!(
                "remaining_amount {} outside [0, {}]",
                self.remaining_amount, self.amount
            ));
        }
        if self.sold && !self.remaining_amount.is_zero() {
            return Err(format!(
                "sold lot still holds {}",
                self.remaining_amount
            ));
        }
        Ok(())
    }
}

/// A confirmed purchase that has not been given an id yet
#[derive(Debug, Clone, PartialEq)]
pub struct NewLot {
    pub buy_price: Decimal,
    pub amount: Decimal,
    pub buy_timestamp: NaiveDateTime,
}

/// Durable, ordered record of every buy lot
///
/// Each mutation rewrites the whole file before returning, so the on-disk
/// ledger always reflects every confirmed order up to the last one.
#[derive(Debug)]
pub struct Ledger {
    path: PathBuf,
    lots: Vec<BuyLot>,
}

impl Ledger {
    /// Load the ledger at `path`, creating a header-only file if none exists
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let path = path.into();

        if !path.exists() {
            tracing::info!("No ledger at {}, starting empty", path.display());
            let ledger = Self {
                path,
                lots: Vec::new(),
            };
            ledger.persist()?;
            return Ok(ledger);
        }

        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_path(&path)
            .map_err(|source| LedgerError::Csv {
                path: path.clone(),
                source,
            })?;

        let mut lots = Vec::new();
        for (row, record) in reader.deserialize::<BuyLot>().enumerate() {
            let lot = record.map_err(|source| LedgerError::Csv {
                path: path.clone(),
                source,
            })?;

            if lot.id as usize != row {
                return Err(LedgerError::Corrupt {
                    row,
                    reason: format!("expected id {}, found {}", row, lot.id),
                });
            }
            lot.check_invariants()
                .map_err(|reason| LedgerError::Corrupt { row, reason })?;

            lots.push(lot);
        }

        tracing::info!("Loaded {} lots from {}", lots.len(), path.display());

        Ok(Self { path, lots })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All lots in ascending id order
    pub fn lots(&self) -> &[BuyLot] {
        &self.lots
    }

    pub fn len(&self) -> usize {
        self.lots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lots.is_empty()
    }

    pub fn get(&self, lot_id: u32) -> Option<&BuyLot> {
        self.lots.get(lot_id as usize)
    }

    pub fn open_lots(&self) -> impl Iterator<Item = &BuyLot> {
        self.lots.iter().filter(|lot| lot.is_open())
    }

    /// Whether a lot was bought on `today` (local calendar date)
    pub fn already_acted_today(&self, today: NaiveDate) -> bool {
        self.lots
            .iter()
            .any(|lot| lot.buy_timestamp.date() == today)
    }

    /// Record a confirmed buy as the next lot and persist
    pub fn append_lot(&mut self, new_lot: NewLot) -> Result<&BuyLot, LedgerError> {
        let id = self.lots.len() as u32;
        let lot = BuyLot {
            id,
            buy_price: new_lot.buy_price,
            amount: new_lot.amount,
            remaining_amount: new_lot.amount,
            sold: false,
            half_sold: false,
            buy_timestamp: new_lot.buy_timestamp,
        };

        if lot.buy_price <= Decimal::ZERO {
            return Err(LedgerError::InvalidTransition {
                lot_id: id,
                reason: format!("buy price {} is not positive", lot.buy_price),
            });
        }
        lot.check_invariants()
            .map_err(|reason| LedgerError::InvalidTransition { lot_id: id, reason })?;

        self.lots.push(lot);
        self.persist()?;

        Ok(&self.lots[id as usize])
    }

    /// Mark a lot fully liquidated and persist
    pub fn record_full_sell(&mut self, lot_id: u32) -> Result<(), LedgerError> {
        let lot = self.lot_mut(lot_id)?;
        if lot.sold {
            return Err(LedgerError::InvalidTransition {
                lot_id,
                reason: "lot already closed".to_string(),
            });
        }

        lot.sold = true;
        lot.remaining_amount = Decimal::ZERO;

        self.persist()
    }

    /// Apply the one-time half liquidation and persist
    pub fn record_half_sell(
        &mut self,
        lot_id: u32,
        sold_amount: Decimal,
    ) -> Result<(), LedgerError> {
        let lot = self.lot_mut(lot_id)?;
        if lot.sold {
            return Err(LedgerError::InvalidTransition {
                lot_id,
                reason: "lot already closed".to_string(),
            });
        }
        if lot.half_sold {
            return Err(LedgerError::InvalidTransition {
                lot_id,
                reason: "half sell already recorded".to_string(),
            });
        }
        if sold_amount <= Decimal::ZERO || sold_amount > lot.remaining_amount {
            return Err(LedgerError::InvalidTransition {
                lot_id,
                reason: format!(
                    "cannot sell {} of remaining {}",
                    sold_amount, lot.remaining_amount
                ),
            });
        }

        lot.half_sold = true;
        lot.remaining_amount -= sold_amount;

        self.persist()
    }

    fn lot_mut(&mut self, lot_id: u32) -> Result<&mut BuyLot, LedgerError> {
        self.lots
            .get_mut(lot_id as usize)
            .ok_or(LedgerError::UnknownLot(lot_id))
    }

    /// Write the full ledger to a sibling temp file, then rename it over the
    /// old one
    fn persist(&self) -> Result<(), LedgerError> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let io_err = |source| LedgerError::Io {
            path: self.path.clone(),
            source,
        };
        let csv_err = |source| LedgerError::Csv {
            path: self.path.clone(),
            source,
        };

        fs::create_dir_all(&dir).map_err(io_err)?;
        let mut tmp = NamedTempFile::new_in(&dir).map_err(io_err)?;

        {
            let mut writer = csv::WriterBuilder::new()
                .has_headers(false)
                .from_writer(&mut tmp);
            writer.write_record(COLUMNS).map_err(csv_err)?;
            for lot in &self.lots {
                writer.serialize(lot).map_err(csv_err)?;
            }
            writer.flush().map_err(io_err)?;
        }

        tmp.flush().map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(&self.path)
            .map_err(|source| LedgerError::Persist {
                path: self.path.clone(),
                source,
            })?;
        sync_dir(&dir).map_err(io_err)?;

        tracing::debug!("Persisted {} lots to {}", self.lots.len(), self.path.display());
        Ok(())
    }
}

/// Flush the directory entry so the rename itself survives a crash
#[cfg(unix)]
fn sync_dir(dir: &Path) -> std::io::Result<()> {
    fs::File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

// ============================================================================
// Field formats
// ============================================================================

// Ledgers written by older tooling carry `True`/`False` and `1e-05`.

fn decimal_field<'de, D>(deserializer: D) -> Result<Decimal, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_decimal(&raw).map_err(serde::de::Error::custom)
}

fn parse_decimal(raw: &str) -> Result<Decimal, String> {
    let raw = raw.trim();
    Decimal::from_str(raw)
        .or_else(|_| Decimal::from_scientific(raw))
        .map(|d| d.normalize())
        .map_err(|e| format!("invalid decimal '{}': {}", raw, e))
}

fn flag_field<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" => Ok(true),
        "false" | "0" | "" => Ok(false),
        other => Err(serde::de::Error::custom(format!(
            "invalid boolean '{}'",
            other
        ))),
    }
}

fn serialize_timestamp<S>(ts: &NaiveDateTime, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&ts.format(TIMESTAMP_FORMAT).to_string())
}

fn timestamp_field<'de, D>(deserializer: D) -> Result<NaiveDateTime, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw).map_err(serde::de::Error::custom)
}

fn parse_timestamp(raw: &str) -> Result<NaiveDateTime, String> {
    let raw = raw.trim();

    if let Ok(ts) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        return Ok(ts);
    }
    if let Ok(ts) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f") {
        return Ok(ts);
    }
    // Offset-qualified stamps are converted to local wall-clock time
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&chrono::Local).naive_local())
        .map_err(|e| format!("invalid timestamp '{}': {}", raw, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;
    use tempfile::TempDir;

    fn at(y: i32, m: u32, d: u32, h: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, 0, 0)
            .unwrap()
    }

    fn new_lot(price: Decimal, amount: Decimal, ts: NaiveDateTime) -> NewLot {
        NewLot {
            buy_price: price,
            amount,
            buy_timestamp: ts,
        }
    }

    fn ledger_in(dir: &TempDir) -> Ledger {
        Ledger::load(dir.path().join("trades.csv")).unwrap()
    }

    #[test]
    fn test_load_creates_header_only_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("trades.csv");

        let ledger = Ledger::load(&path).unwrap();
        assert!(ledger.is_empty());

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(
            content.trim(),
            "id,buy_price,amount,remaining_amount,sold,half_sold,buy_timestamp"
        );

        // Reloading the header-only file is still empty
        assert!(Ledger::load(&path).unwrap().is_empty());
    }

    #[test]
    fn test_append_assigns_sequential_ids() {
        let dir = TempDir::new().unwrap();
        let mut ledger = ledger_in(&dir);

        let first = ledger
            .append_lot(new_lot(dec!(9000000), dec!(0.00011111), at(2025, 1, 1, 9)))
            .unwrap()
            .id;
        let second = ledger
            .append_lot(new_lot(dec!(8500000), dec!(0.00013058), at(2025, 1, 2, 9)))
            .unwrap()
            .id;

        assert_eq!(first, 0);
        assert_eq!(second, 1);

        let lot = ledger.get(1).unwrap();
        assert_eq!(lot.remaining_amount, lot.amount);
        assert_eq!(lot.state(), LotState::Open);
    }

    #[test]
    fn test_round_trip_preserves_fields() {
        let dir = TempDir::new().unwrap();
        let mut ledger = ledger_in(&dir);

        let mut ts = at(2025, 3, 4, 10);
        ts += chrono::Duration::microseconds(123456);
        ledger
            .append_lot(new_lot(dec!(1000000), dec!(0.001), ts))
            .unwrap();
        ledger
            .append_lot(new_lot(dec!(1250000.5), dec!(0.0008), at(2025, 3, 5, 10)))
            .unwrap();
        ledger.record_half_sell(0, dec!(0.0005)).unwrap();
        ledger.record_full_sell(1).unwrap();

        let reloaded = Ledger::load(ledger.path()).unwrap();
        assert_eq!(reloaded.lots(), ledger.lots());
    }

    #[test]
    fn test_already_acted_today_is_date_only() {
        let dir = TempDir::new().unwrap();
        let mut ledger = ledger_in(&dir);
        let today = NaiveDate::from_ymd_opt(2025, 2, 10).unwrap();

        assert!(!ledger.already_acted_today(today));

        ledger
            .append_lot(new_lot(dec!(1000000), dec!(0.001), at(2025, 2, 9, 23)))
            .unwrap();
        assert!(!ledger.already_acted_today(today));

        ledger
            .append_lot(new_lot(dec!(1000000), dec!(0.001), at(2025, 2, 10, 0)))
            .unwrap();
        assert!(ledger.already_acted_today(today));
    }

    #[test]
    fn test_half_then_full_sell() {
        let dir = TempDir::new().unwrap();
        let mut ledger = ledger_in(&dir);
        ledger
            .append_lot(new_lot(dec!(1000000), dec!(0.001), at(2025, 1, 1, 9)))
            .unwrap();

        ledger.record_half_sell(0, dec!(0.0005)).unwrap();
        let lot = ledger.get(0).unwrap();
        assert_eq!(lot.state(), LotState::HalfSold);
        assert_eq!(lot.remaining_amount, dec!(0.0005));
        assert!(lot.is_open());

        ledger.record_full_sell(0).unwrap();
        let lot = ledger.get(0).unwrap();
        assert_eq!(lot.state(), LotState::Closed);
        assert_eq!(lot.remaining_amount, Decimal::ZERO);
        assert!(!lot.is_open());
        assert_eq!(ledger.open_lots().count(), 0);
    }

    #[test]
    fn test_second_half_sell_rejected() {
        let dir = TempDir::new().unwrap();
        let mut ledger = ledger_in(&dir);
        ledger
            .append_lot(new_lot(dec!(1000000), dec!(0.001), at(2025, 1, 1, 9)))
            .unwrap();
        ledger.record_half_sell(0, dec!(0.0005)).unwrap();

        let result = ledger.record_half_sell(0, dec!(0.00025));
        assert!(matches!(
            result,
            Err(LedgerError::InvalidTransition { lot_id: 0, .. })
        ));
        assert_eq!(ledger.get(0).unwrap().remaining_amount, dec!(0.0005));
    }

    #[test]
    fn test_oversized_half_sell_rejected() {
        let dir = TempDir::new().unwrap();
        let mut ledger = ledger_in(&dir);
        ledger
            .append_lot(new_lot(dec!(1000000), dec!(0.001), at(2025, 1, 1, 9)))
            .unwrap();

        assert!(ledger.record_half_sell(0, dec!(0.002)).is_err());
        assert!(ledger.record_half_sell(0, Decimal::ZERO).is_err());
        assert!(!ledger.get(0).unwrap().half_sold);
    }

    #[test]
    fn test_closed_lot_cannot_be_sold_again() {
        let dir = TempDir::new().unwrap();
        let mut ledger = ledger_in(&dir);
        ledger
            .append_lot(new_lot(dec!(1000000), dec!(0.001), at(2025, 1, 1, 9)))
            .unwrap();
        ledger.record_full_sell(0).unwrap();

        assert!(ledger.record_full_sell(0).is_err());
        assert!(ledger.record_half_sell(0, dec!(0.0001)).is_err());
    }

    #[test]
    fn test_unknown_lot() {
        let dir = TempDir::new().unwrap();
        let mut ledger = ledger_in(&dir);

        let result = ledger.record_full_sell(7);
        assert!(matches!(result, Err(LedgerError::UnknownLot(7))));
    }

    #[test]
    fn test_loads_legacy_format() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("trades.csv");
        fs::write(
            &path,
            "id,buy_price,amount,remaining_amount,sold,half_sold,buy_timestamp\n\
             0,9500000.0,1e-05,1e-05,False,False,2025-01-06T09:00:03.512345\n\
             1,9100000.0,0.00012,0.0,True,True,2025-01-07T09:00:02.100000\n",
        )
        .unwrap();

        let ledger = Ledger::load(&path).unwrap();
        assert_eq!(ledger.len(), 2);

        let first = ledger.get(0).unwrap();
        assert_eq!(first.amount, dec!(0.00001));
        assert_eq!(first.buy_price, dec!(9500000));
        assert!(!first.sold);

        let second = ledger.get(1).unwrap();
        assert!(second.sold && second.half_sold);
        assert_eq!(second.state(), LotState::Closed);
    }

    #[test]
    fn test_inconsistent_row_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("trades.csv");
        fs::write(
            &path,
            "id,buy_price,amount,remaining_amount,sold,half_sold,buy_timestamp\n\
             0,1000000,0.001,0.002,false,false,2025-01-06T09:00:00.000000\n",
        )
        .unwrap();

        let result = Ledger::load(&path);
        assert!(matches!(result, Err(LedgerError::Corrupt { row: 0, .. })));
    }

    #[test]
    fn test_persist_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let mut ledger = ledger_in(&dir);
        ledger
            .append_lot(new_lot(dec!(1000000), dec!(0.001), at(2025, 1, 1, 9)))
            .unwrap();
        ledger.record_half_sell(0, dec!(0.0005)).unwrap();

        let entries: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from("trades.csv")]);
    }

    #[test]
    fn test_persist_into_new_directory_is_synced() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("state").join("trades.csv");

        let mut ledger = Ledger::load(&nested).unwrap();
        ledger
            .append_lot(new_lot(dec!(1000000), dec!(0.001), at(2025, 1, 1, 9)))
            .unwrap();

        assert!(sync_dir(&dir.path().join("state")).is_ok());
        assert_eq!(Ledger::load(&nested).unwrap().len(), 1);
    }

    #[test]
    fn test_persist_fails_when_directory_disappears() {
        let dir = TempDir::new().unwrap();
        let state = dir.path().join("state");
        let mut ledger = Ledger::load(state.join("trades.csv")).unwrap();

        // A regular file where the ledger directory used to be
        fs::remove_dir_all(&state).unwrap();
        fs::write(&state, b"not a directory").unwrap();

        let result = ledger.append_lot(new_lot(dec!(1000000), dec!(0.001), at(2025, 1, 1, 9)));
        assert!(matches!(result, Err(LedgerError::Io { .. })));
    }

    #[test]
    fn test_ratio() {
        let lot = BuyLot {
            id: 0,
            buy_price: dec!(1000000),
            amount: dec!(0.001),
            remaining_amount: dec!(0.001),
            sold: false,
            half_sold: false,
            buy_timestamp: at(2025, 1, 1, 9),
        };
        assert_eq!(lot.ratio(dec!(2900000)), dec!(2.9));
        assert_eq!(lot.ratio(dec!(3950000)), dec!(3.95));
    }
}
