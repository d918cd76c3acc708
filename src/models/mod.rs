pub mod enums;
pub mod report;
pub mod survey;

pub use enums::*;
pub use report::*;
pub use survey::*;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("Invalid value for {field}: {value}")]
    InvalidEnum { field: String, value: String },

    #[error("Risk score {0} is outside 0-100")]
    RiskScoreOutOfRange(i64),

    #[error("Estimated stage {0} is outside 0-3")]
    StageOutOfRange(i64),
}
