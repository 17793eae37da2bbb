//! Engineering unit systems and per-MSID conversions.
//!
//! Values are stored in the `cxc` system. Each MSID carries a unit label and
//! a scalar conversion for each of the three selectable systems, so a fetch
//! can return values in `cxc`, `sci` or `eng` units. Conversions are affine
//! (`out = v * scale + offset`) and exactly invertible.

/// Selectable unit system for fetch output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum UnitSystem {
    /// Storage units (SI-leaning, e.g. Kelvin).
    #[default]
    Cxc,
    /// Science units (e.g. degrees Celsius).
    Sci,
    /// Legacy engineering units (e.g. degrees Fahrenheit).
    Eng,
}

impl UnitSystem {
    /// All systems, in declaration order.
    pub const ALL: [UnitSystem; 3] = [UnitSystem::Cxc, UnitSystem::Sci, UnitSystem::Eng];

    /// Short lower-case name of the system.
    pub fn name(self) -> &'static str {
        match self {
            UnitSystem::Cxc => "cxc",
            UnitSystem::Sci => "sci",
            UnitSystem::Eng => "eng",
        }
    }

    fn idx(self) -> usize {
        match self {
            UnitSystem::Cxc => 0,
            UnitSystem::Sci => 1,
            UnitSystem::Eng => 2,
        }
    }
}

/// Affine scalar conversion applied to values leaving storage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UnitConv {
    /// Multiplicative factor.
    pub scale: f64,
    /// Additive offset, applied after scaling.
    pub offset: f64,
}

impl Default for UnitConv {
    fn default() -> Self {
        Self::identity()
    }
}

impl UnitConv {
    /// The identity conversion.
    pub fn identity() -> Self {
        Self { scale: 1.0, offset: 0.0 }
    }

    /// Pure scale factor.
    pub fn scale(scale: f64) -> Self {
        Self { scale, offset: 0.0 }
    }

    /// Pure offset.
    pub fn offset(offset: f64) -> Self {
        Self { scale: 1.0, offset }
    }

    /// Returns true if this conversion leaves values unchanged.
    pub fn is_identity(&self) -> bool {
        self.scale == 1.0 && self.offset == 0.0
    }

    /// Converts a single value out of storage units.
    pub fn apply(&self, v: f64) -> f64 {
        v * self.scale + self.offset
    }

    /// Converts a single value back into storage units.
    pub fn invert(&self, v: f64) -> f64 {
        (v - self.offset) / self.scale
    }

    /// Converts a slice in place.
    pub fn apply_all(&self, vals: &mut [f64]) {
        if self.is_identity() {
            return;
        }
        for v in vals.iter_mut() {
            *v = self.apply(*v);
        }
    }
}

/// Per-MSID unit labels and conversions for the three systems.
///
/// The `cxc` entry always has the identity conversion since values are
/// stored in `cxc` units.
#[derive(Debug, Clone, Default)]
pub struct UnitTable {
    entries: [Option<(String, UnitConv)>; 3],
}

impl UnitTable {
    /// Dimensionless MSID with no unit label in any system.
    pub fn none() -> Self {
        Self::default()
    }

    /// The same unit label in every system, with identity conversion.
    pub fn plain(label: &str) -> Self {
        let mut table = Self::default();
        for system in UnitSystem::ALL {
            table.set(system, label, UnitConv::identity());
        }
        table
    }

    /// Temperature stored in Kelvin, reported as degC (sci) and degF (eng).
    pub fn kelvin() -> Self {
        let mut table = Self::default();
        table.set(UnitSystem::Cxc, "K", UnitConv::identity());
        table.set(UnitSystem::Sci, "DEGC", UnitConv::offset(-273.15));
        table.set(
            UnitSystem::Eng,
            "DEGF",
            UnitConv { scale: 1.8, offset: -459.67 },
        );
        table
    }

    /// Sets the label and conversion for one system.
    pub fn set(&mut self, system: UnitSystem, label: &str, conv: UnitConv) {
        self.entries[system.idx()] = Some((label.to_string(), conv));
    }

    /// Builder-style variant of [`set`](Self::set).
    pub fn with(mut self, system: UnitSystem, label: &str, conv: UnitConv) -> Self {
        self.set(system, label, conv);
        self
    }

    /// Unit label for the requested system, falling back to the storage
    /// label when the system has no entry.
    pub fn label(&self, system: UnitSystem) -> Option<&str> {
        self.entries[system.idx()]
            .as_ref()
            .or(self.entries[UnitSystem::Cxc.idx()].as_ref())
            .map(|(label, _)| label.as_str())
    }

    /// Conversion from storage units to the requested system.
    pub fn conv(&self, system: UnitSystem) -> UnitConv {
        self.entries[system.idx()]
            .as_ref()
            .map(|(_, conv)| *conv)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kelvin_conversions() {
        let table = UnitTable::kelvin();
        let sci = table.conv(UnitSystem::Sci);
        let eng = table.conv(UnitSystem::Eng);
        assert!((sci.apply(273.15) - 0.0).abs() < 1e-12);
        assert!((eng.apply(273.15) - 32.0).abs() < 1e-9);
        assert_eq!(table.label(UnitSystem::Eng), Some("DEGF"));
    }

    #[test]
    fn test_round_trip_identity() {
        let convs = [
            UnitConv::identity(),
            UnitConv::scale(0.145),
            UnitConv::offset(-273.15),
            UnitConv { scale: 1.8, offset: -459.67 },
        ];
        for conv in convs {
            for v in [0.0, 1.0, -40.0, 301.5, 1e6] {
                assert!((conv.invert(conv.apply(v)) - v).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn test_label_fallback() {
        let mut table = UnitTable::none();
        table.set(UnitSystem::Cxc, "rad", UnitConv::identity());
        assert_eq!(table.label(UnitSystem::Sci), Some("rad"));
        assert!(table.conv(UnitSystem::Sci).is_identity());
    }
}
