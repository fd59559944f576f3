//! Molecular systems: atoms, electron counts, unit conversion.
//!
//! All internal coordinates are in bohr. External descriptors (built by a
//! quantum-chemistry package) may declare angstrom units and are converted
//! on ingestion.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::error::TrainError;

/// Angstrom to bohr conversion factor (CODATA 2018).
pub const ANGSTROM_BOHR: f64 = 1.889_726_124_565_062;

/// Symbols and atomic numbers for the first three rows.
const ELEMENTS: &[(&str, u32)] = &[
    ("H", 1),
    ("He", 2),
    ("Li", 3),
    ("Be", 4),
    ("B", 5),
    ("C", 6),
    ("N", 7),
    ("O", 8),
    ("F", 9),
    ("Ne", 10),
    ("Na", 11),
    ("Mg", 12),
    ("Al", 13),
    ("Si", 14),
    ("P", 15),
    ("S", 16),
    ("Cl", 17),
    ("Ar", 18),
];

pub fn atomic_number(symbol: &str) -> Option<u32> {
    ELEMENTS
        .iter()
        .find(|(s, _)| *s == symbol)
        .map(|(_, z)| *z)
}

/// A nucleus: symbol, charge and position in bohr.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Atom {
    pub symbol: String,
    pub charge: f64,
    pub coords: Vector3<f64>,
}

impl Atom {
    pub fn new(symbol: &str, coords: Vector3<f64>) -> Result<Self, TrainError> {
        let z = atomic_number(symbol)
            .ok_or_else(|| TrainError::Config(format!("unknown element symbol {symbol:?}")))?;
        Ok(Self {
            symbol: symbol.to_string(),
            charge: z as f64,
            coords,
        })
    }
}

/// Immutable description of the physical system being trained on.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MoleculeConfig {
    pub atoms: Vec<Atom>,
    pub n_up: usize,
    pub n_down: usize,
}

impl MoleculeConfig {
    /// Build from atoms plus net charge and spin (n_up - n_down).
    ///
    /// Fails when the electron count implied by the nuclear charges and the
    /// net charge cannot be partitioned into the requested spin channels.
    pub fn with_charge_and_spin(
        atoms: Vec<Atom>,
        charge: i32,
        spin: i32,
    ) -> Result<Self, TrainError> {
        let nuclear: i64 = atoms.iter().map(|a| a.charge as i64).sum();
        let n_electrons = nuclear - charge as i64;
        if n_electrons < 0 {
            return Err(TrainError::Config(format!(
                "charge {charge} leaves a negative electron count for nuclear charge {nuclear}"
            )));
        }
        if spin.unsigned_abs() as i64 > n_electrons || (n_electrons - spin as i64) % 2 != 0 {
            return Err(TrainError::Config(format!(
                "spin {spin} is inconsistent with {n_electrons} electrons"
            )));
        }
        let n_up = ((n_electrons + spin as i64) / 2) as usize;
        let n_down = ((n_electrons - spin as i64) / 2) as usize;
        Ok(Self { atoms, n_up, n_down })
    }

    pub fn n_electrons(&self) -> usize {
        self.n_up + self.n_down
    }

    /// Nuclear-nuclear Coulomb repulsion, a constant of the geometry.
    pub fn nuclear_repulsion(&self) -> f64 {
        let n = self.atoms.len();
        let mut energy = 0.0;
        for i in 0..n {
            for j in (i + 1)..n {
                let r = (self.atoms[i].coords - self.atoms[j].coords).norm();
                energy += self.atoms[i].charge * self.atoms[j].charge / r;
            }
        }
        energy
    }
}

/// Length unit declared by an external molecule descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LengthUnit {
    Bohr,
    Angstrom,
}

/// One atom as reported by an external quantum-chemistry package.
#[derive(Clone, Debug)]
pub struct ExternalAtom {
    pub symbol: String,
    pub coords: [f64; 3],
}

/// Molecule descriptor built by an external quantum-chemistry package,
/// carrying its own unit declaration, spin-channel populations and basis.
#[derive(Clone, Debug)]
pub struct ExternalMolecule {
    pub atoms: Vec<ExternalAtom>,
    pub unit: LengthUnit,
    /// (spin-up, spin-down) electron counts.
    pub nelec: (usize, usize),
    pub basis: String,
}

impl ExternalMolecule {
    /// Convert to the internal representation, normalizing coordinates to
    /// bohr. Electron counts are taken from the descriptor's spin channels.
    pub fn to_molecule(&self) -> Result<MoleculeConfig, TrainError> {
        let scale = match self.unit {
            LengthUnit::Bohr => 1.0,
            LengthUnit::Angstrom => ANGSTROM_BOHR,
        };
        let atoms = self
            .atoms
            .iter()
            .map(|a| {
                Atom::new(
                    &a.symbol,
                    Vector3::new(a.coords[0], a.coords[1], a.coords[2]) * scale,
                )
            })
            .collect::<Result<Vec<_>, _>>()?;
        let nuclear: i64 = atoms.iter().map(|a| a.charge as i64).sum();
        let n_electrons = (self.nelec.0 + self.nelec.1) as i64;
        // A net charge of a few electrons either way is physical; more than
        // the nuclear charge itself is a malformed descriptor.
        if n_electrons == 0 || n_electrons > 2 * nuclear {
            return Err(TrainError::Config(format!(
                "external molecule reports {n_electrons} electrons for nuclear charge {nuclear}"
            )));
        }
        Ok(MoleculeConfig {
            atoms,
            n_up: self.nelec.0,
            n_down: self.nelec.1,
        })
    }
}

/// Geometry and ground-state spin for the built-in named systems.
pub fn named_system(name: &str) -> Result<(Vec<Atom>, i32), TrainError> {
    let origin = Vector3::zeros();
    match name {
        "H" => Ok((vec![Atom::new("H", origin)?], 1)),
        "Li" => Ok((vec![Atom::new("Li", origin)?], 1)),
        "H2" => Ok((
            vec![
                Atom::new("H", Vector3::new(0.0, 0.0, -0.7005))?,
                Atom::new("H", Vector3::new(0.0, 0.0, 0.7005))?,
            ],
            0,
        )),
        "LiH" => Ok((
            vec![
                Atom::new("Li", origin)?,
                Atom::new("H", Vector3::new(0.0, 0.0, 3.015))?,
            ],
            0,
        )),
        "H2O" => Ok((
            vec![
                Atom::new("O", origin)?,
                Atom::new("H", Vector3::new(0.0, 1.43, 1.11))?,
                Atom::new("H", Vector3::new(0.0, -1.43, 1.11))?,
            ],
            0,
        )),
        _ => Err(TrainError::Config(format!(
            "unknown system name {name:?}"
        ))),
    }
}
