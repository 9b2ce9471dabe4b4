use analysis_core::AnalysisError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Named stock universes a sector request can resolve to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sector {
    Technology,
    Healthcare,
    Financials,
    Energy,
    Consumer,
    Industrials,
    Communication,
}

impl Sector {
    pub const ALL: [Sector; 7] = [
        Sector::Technology,
        Sector::Healthcare,
        Sector::Financials,
        Sector::Energy,
        Sector::Consumer,
        Sector::Industrials,
        Sector::Communication,
    ];

    pub fn id(&self) -> &'static str {
        match self {
            Sector::Technology => "technology",
            Sector::Healthcare => "healthcare",
            Sector::Financials => "financials",
            Sector::Energy => "energy",
            Sector::Consumer => "consumer",
            Sector::Industrials => "industrials",
            Sector::Communication => "communication",
        }
    }

    pub fn symbols(&self) -> &'static [&'static str] {
        match self {
            Sector::Technology => &[
                "AAPL", "MSFT", "NVDA", "GOOGL", "META", "AVGO", "ORCL", "CRM", "ADBE", "AMD",
                "CSCO", "INTC", "QCOM", "IBM", "NOW",
            ],
            Sector::Healthcare => &[
                "UNH", "JNJ", "LLY", "ABBV", "MRK", "PFE", "TMO", "ABT", "DHR", "BMY", "AMGN",
                "GILD",
            ],
            Sector::Financials => &[
                "JPM", "BAC", "WFC", "GS", "MS", "C", "BLK", "SCHW", "AXP", "V", "MA", "BRK.B",
            ],
            Sector::Energy => &[
                "XOM", "CVX", "COP", "EOG", "SLB", "PSX", "MPC", "OXY", "VLO", "KMI",
            ],
            Sector::Consumer => &[
                "AMZN", "TSLA", "WMT", "HD", "COST", "PG", "KO", "PEP", "MCD", "NKE", "SBUX",
                "TGT",
            ],
            Sector::Industrials => &[
                "CAT", "DE", "HON", "UNP", "UPS", "GE", "BA", "LMT", "RTX", "MMM",
            ],
            Sector::Communication => &[
                "GOOG", "NFLX", "DIS", "CMCSA", "T", "VZ", "TMUS", "CHTR", "EA",
            ],
        }
    }

    pub fn symbol_list(&self) -> Vec<String> {
        self.symbols().iter().map(|s| s.to_string()).collect()
    }
}

impl fmt::Display for Sector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for Sector {
    type Err = AnalysisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let sector = match s.trim().to_lowercase().as_str() {
            "technology" | "tech" => Sector::Technology,
            "healthcare" | "health" => Sector::Healthcare,
            "financials" | "financial" | "finance" => Sector::Financials,
            "energy" => Sector::Energy,
            "consumer" => Sector::Consumer,
            "industrials" | "industrial" => Sector::Industrials,
            "communication" | "communications" => Sector::Communication,
            _ => return Err(AnalysisError::Validation(format!("unknown sector '{}'", s))),
        };
        Ok(sector)
    }
}
