use ck_types::{CkResult, Instrument};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;

/// Contracts known to return data, used when no contract files are present.
const BUILTIN_CONTRACTS: [(&str, &str, &str); 4] = [
    ("GOLD03OCT25FUT", "MCX", "440939"),
    ("NATURALGAS25JUN25FUT", "MCX", "446265"),
    ("ALUMINIUM30MAY25FUT", "MCX", "446487"),
    ("NICKEL30MAY25FUT", "MCX", "446491"),
];

const CONTRACT_FILE: &str = "working_contract.json";
const SPECIFIC_CONTRACT_PREFIX: &str = "working_specific_contract_";

#[derive(Debug, Deserialize)]
struct ContractFile {
    contract: ContractEntry,
}

#[derive(Debug, Deserialize)]
struct ContractEntry {
    name: String,
    exchange: String,
    token: String,
}

/// Maps user-facing exchange names onto the ones the API accepts.
pub fn canonical_exchange(exchange: &str) -> String {
    match exchange.trim().to_ascii_uppercase().as_str() {
        "MCX" | "MCX_FO" => "MCX".to_string(),
        "NCX" | "NCX_FO" | "NCDEX" => "NCX".to_string(),
        other => other.to_string(),
    }
}

/// Commodity instruments available for ingestion
#[derive(Debug, Clone, Default)]
pub struct CommodityCatalog {
    instruments: Vec<Instrument>,
}

impl CommodityCatalog {
    pub fn new(instruments: Vec<Instrument>) -> Self {
        let mut catalog = Self::default();
        for instrument in instruments {
            catalog.add(instrument);
        }
        catalog
    }

    pub fn builtin() -> Self {
        Self::new(
            BUILTIN_CONTRACTS
                .iter()
                .map(|(name, exchange, token)| Instrument::new(name, exchange, token))
                .collect(),
        )
    }

    /// Adds an instrument unless one with the same exchange and token exists.
    pub fn add(&mut self, mut instrument: Instrument) -> bool {
        instrument.exchange = canonical_exchange(&instrument.exchange);
        let exists = self.instruments.iter().any(|i| {
            i.exchange == instrument.exchange && i.symbol_token == instrument.symbol_token
        });
        if !exists {
            self.instruments.push(instrument);
        }
        !exists
    }

    /// Merge `working_contract.json` and `working_specific_contract_*.json`
    /// from `dir`. Unreadable files are skipped with a warning.
    pub fn load_contract_files<P: AsRef<Path>>(&mut self, dir: P) -> CkResult<usize> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Ok(0);
        }

        let mut files = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => name.to_string(),
                None => continue,
            };
            let is_contract = name == CONTRACT_FILE
                || (name.starts_with(SPECIFIC_CONTRACT_PREFIX) && name.ends_with(".json"));
            if is_contract {
                files.push(path);
            }
        }
        files.sort();

        let mut added = 0;
        for path in files {
            let parsed = std::fs::read_to_string(&path)
                .map_err(|e| e.to_string())
                .and_then(|text| {
                    serde_json::from_str::<ContractFile>(&text).map_err(|e| e.to_string())
                });
            match parsed {
                Ok(file) => {
                    let c = file.contract;
                    if self.add(Instrument::new(&c.name, &c.exchange, &c.token)) {
                        tracing::debug!("Loaded contract {} from {}", c.name, path.display());
                        added += 1;
                    }
                }
                Err(e) => tracing::warn!("Skipping contract file {}: {}", path.display(), e),
            }
        }
        Ok(added)
    }

    pub fn instruments(&self) -> &[Instrument] {
        &self.instruments
    }

    /// Instruments matching an optional exchange (aliases accepted) and an
    /// optional commodity name. A name matches exactly first, else by prefix.
    pub fn select(&self, exchange: Option<&str>, commodity: Option<&str>) -> Vec<Instrument> {
        let exchange = exchange.map(canonical_exchange);
        let on_exchange: Vec<&Instrument> = self
            .instruments
            .iter()
            .filter(|i| exchange.as_ref().map_or(true, |e| &i.exchange == e))
            .collect();

        let Some(commodity) = commodity.map(|c| c.trim().to_ascii_uppercase()) else {
            return on_exchange.into_iter().cloned().collect();
        };

        let exact: Vec<Instrument> = on_exchange
            .iter()
            .filter(|i| i.name.eq_ignore_ascii_case(&commodity))
            .map(|i| (*i).clone())
            .collect();
        if !exact.is_empty() {
            return exact;
        }
        on_exchange
            .into_iter()
            .filter(|i| i.name.to_ascii_uppercase().starts_with(&commodity))
            .cloned()
            .collect()
    }
}
