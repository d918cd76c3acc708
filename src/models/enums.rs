use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::ModelError;

/// Macro to generate a label enum with as_str + FromStr + string serde.
macro_rules! label_enum {
    ($name:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$(Self::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $s),+
                }
            }
        }

        impl std::str::FromStr for $name {
            type Err = ModelError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok(Self::$variant)),+,
                    _ => Err(ModelError::InvalidEnum {
                        field: stringify!($name).into(),
                        value: s.into(),
                    }),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(self.as_str())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let raw = String::deserialize(deserializer)?;
                raw.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

label_enum!(Symptom {
    BullseyeRash => "Bull's-eye rash",
    OtherRash => "Other rash",
    FeverOrChills => "Fever or chills",
    Headache => "Headache",
    Fatigue => "Fatigue",
    MuscleOrJointAches => "Muscle or joint aches",
    SwollenLymphNodes => "Swollen lymph nodes",
    StiffNeck => "Stiff neck",
    FacialPalsy => "Facial palsy",
    HeartPalpitations => "Heart palpitations",
    NervePain => "Nerve pain",
    NumbnessOrTingling => "Numbness or tingling",
});

/// How soon the user should see a doctor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DoctorUrgency {
    NotUrgent,
    SemiUrgent,
    VeryUrgent,
}

impl DoctorUrgency {
    pub const ALL: &'static [DoctorUrgency] =
        &[Self::NotUrgent, Self::SemiUrgent, Self::VeryUrgent];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotUrgent => "Not urgent",
            Self::SemiUrgent => "Semi-urgent",
            Self::VeryUrgent => "Very urgent",
        }
    }
}

impl std::str::FromStr for DoctorUrgency {
    type Err = ModelError;

    /// Accepts the canonical labels plus case and separator variants
    /// ("not-urgent", "SEMI_URGENT", "very urgent").
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .trim()
            .chars()
            .map(|c| match c {
                '_' | ' ' => '-',
                other => other.to_ascii_lowercase(),
            })
            .collect();

        match normalized.as_str() {
            "not-urgent" | "non-urgent" => Ok(Self::NotUrgent),
            "semi-urgent" => Ok(Self::SemiUrgent),
            "very-urgent" => Ok(Self::VeryUrgent),
            _ => Err(ModelError::InvalidEnum {
                field: "DoctorUrgency".into(),
                value: s.into(),
            }),
        }
    }
}

impl std::fmt::Display for DoctorUrgency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for DoctorUrgency {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for DoctorUrgency {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Clinical stage of Lyme disease, encoded on the wire as 0-3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum EstimatedStage {
    /// No signs of infection.
    NoSigns,
    EarlyLocalized,
    EarlyDisseminated,
    LateDisseminated,
}

impl EstimatedStage {
    pub fn number(&self) -> u8 {
        match self {
            Self::NoSigns => 0,
            Self::EarlyLocalized => 1,
            Self::EarlyDisseminated => 2,
            Self::LateDisseminated => 3,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::NoSigns => "No signs",
            Self::EarlyLocalized => "Early localized",
            Self::EarlyDisseminated => "Early disseminated",
            Self::LateDisseminated => "Late disseminated",
        }
    }

    /// Typical time since the bite for this stage. `None` for stage 0.
    pub fn time_window(&self) -> Option<&'static str> {
        match self {
            Self::NoSigns => None,
            Self::EarlyLocalized => Some("3-30 days"),
            Self::EarlyDisseminated => Some("3-10 weeks"),
            Self::LateDisseminated => Some("2-12+ months"),
        }
    }
}

impl TryFrom<i64> for EstimatedStage {
    type Error = ModelError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::NoSigns),
            1 => Ok(Self::EarlyLocalized),
            2 => Ok(Self::EarlyDisseminated),
            3 => Ok(Self::LateDisseminated),
            other => Err(ModelError::StageOutOfRange(other)),
        }
    }
}

impl From<EstimatedStage> for i64 {
    fn from(stage: EstimatedStage) -> Self {
        i64::from(stage.number())
    }
}
