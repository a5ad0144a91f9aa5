//! The capability set an actuator state must offer.
//!
//! A state is seen by the interpolator as a fixed list of `f64` fields. The
//! first field is special for [`Timing::Speed`](cadence_types::Timing)
//! commands: its distance to the target, divided by the speed, gives the
//! duration every other field is interpolated over.
//!
//! | State | Fields | Interpolable |
//! |---|---|---|
//! | [`Scalar`] | 1 | yes |
//! | [`Vector<N>`] | `N` | yes |
//! | [`Toggle`] | 1 (`0.0` / `1.0`) | no, direct commands only |

use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Value an actuator can be driven to.
pub trait State:
    Clone + Debug + Default + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Whether commands other than `Direct` make sense for this state.
    const INTERPOLABLE: bool = true;

    fn fields(&self) -> Vec<f64>;

    /// Rebuild a state from fields produced by [`fields`](State::fields)
    /// and then interpolated.
    fn from_fields(fields: &[f64]) -> Self;
}

/// A single floating point value (position, pressure, ...).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Scalar(pub f64);

impl State for Scalar {
    fn fields(&self) -> Vec<f64> {
        vec![self.0]
    }

    fn from_fields(fields: &[f64]) -> Self {
        Scalar(fields.first().copied().unwrap_or_default())
    }
}

impl From<f64> for Scalar {
    fn from(value: f64) -> Self {
        Scalar(value)
    }
}

/// `N` values interpolated together, e.g. a 3D position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Vector<const N: usize>(#[serde(with = "fixed")] pub [f64; N]);

impl<const N: usize> Default for Vector<N> {
    fn default() -> Self {
        Vector([0.0; N])
    }
}

impl<const N: usize> State for Vector<N> {
    fn fields(&self) -> Vec<f64> {
        self.0.to_vec()
    }

    fn from_fields(fields: &[f64]) -> Self {
        let mut values = [0.0; N];
        for (value, field) in values.iter_mut().zip(fields) {
            *value = *field;
        }
        Vector(values)
    }
}

/// On/off actuator such as a valve or a gripper.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Toggle(pub bool);

impl State for Toggle {
    const INTERPOLABLE: bool = false;

    fn fields(&self) -> Vec<f64> {
        vec![if self.0 { 1.0 } else { 0.0 }]
    }

    fn from_fields(fields: &[f64]) -> Self {
        Toggle(fields.first().is_some_and(|v| *v >= 0.5))
    }
}

/// serde only derives arrays up to 32 elements; go through a sequence.
mod fixed {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer, const N: usize>(
        values: &[f64; N],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        values.as_slice().serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>, const N: usize>(
        deserializer: D,
    ) -> Result<[f64; N], D::Error> {
        let values = Vec::<f64>::deserialize(deserializer)?;
        let len = values.len();
        values
            .try_into()
            .map_err(|_| D::Error::invalid_length(len, &"a fixed number of fields"))
    }
}
