//! Multi-determinant wavefunction network.
//!
//! A permutation-equivariant feature stream feeds per-determinant orbital
//! readouts with per-atom exponential envelopes. Each determinant
//! factorizes into a spin-up and a spin-down block; the amplitude is the
//! signed log-sum-exp of the block log-determinants over determinants.
//!
//! Parameter gradients are hand-derived: d log|det M| / dM = M^{-T},
//! propagated through the orbital readout and the dense stream. Coordinate
//! derivatives (for the kinetic energy) use the central-difference defaults
//! of `LogAmplitude`.

use nalgebra::{DMatrix, DVector, Vector3};
use rand::Rng;
use rand_distr::{Distribution, Normal};

use super::params::{DenseParams, DetParams, NetworkGradients, NetworkParameters, OrbitalParams};
use super::LayerStats;
use crate::rng::RngKey;
use crate::system::MoleculeConfig;

/// Sign and log-magnitude of an antisymmetric amplitude.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SignedLog {
    pub sign: f64,
    pub logabs: f64,
}

/// One spin block of one determinant, cached from a forward pass.
pub struct BlockCache {
    /// Orbital value matrix, rows = electrons of this spin, cols = orbitals.
    pub m: DMatrix<f64>,
    /// Linear readout part of `m` (before the envelope).
    pub rho: DMatrix<f64>,
    /// Envelope part of `m`.
    pub env: DMatrix<f64>,
    pub sign: f64,
    pub logabs: f64,
}

pub struct DetCache {
    pub up: BlockCache,
    pub dn: BlockCache,
}

/// Intermediate state of a forward pass, retained for backprop.
pub struct ForwardCache {
    /// Electron-atom distances, `dists[electron][atom]`.
    pub dists: Vec<Vec<f64>>,
    /// Hidden features per layer; `h[0]` are the input features.
    pub h: Vec<Vec<DVector<f64>>>,
    /// Dense-layer inputs (own features concatenated with spin means).
    pub g: Vec<Vec<DVector<f64>>>,
    pub dets: Vec<DetCache>,
    pub sign: f64,
    pub logabs: f64,
}

impl ForwardCache {
    pub fn signed(&self) -> SignedLog {
        SignedLog { sign: self.sign, logabs: self.logabs }
    }
}

/// The wavefunction network. Immutable; all state lives in
/// `NetworkParameters`.
#[derive(Clone, Debug)]
pub struct DetNet {
    atoms: Vec<Vector3<f64>>,
    n_up: usize,
    n_dn: usize,
    hidden_dims: Vec<usize>,
    determinants: usize,
}

/// Sign and log-magnitude of det(m) via LU.
fn slogdet(m: &DMatrix<f64>) -> (f64, f64) {
    let n = m.nrows();
    if n == 0 {
        // An empty spin channel contributes a factor of one.
        return (1.0, 0.0);
    }
    let lu = m.clone().lu();
    let mut sign: f64 = lu.p().determinant::<f64>();
    let mut logabs = 0.0;
    let u = lu.u();
    for i in 0..n {
        let d = u[(i, i)];
        if d == 0.0 {
            return (0.0, f64::NEG_INFINITY);
        }
        sign *= d.signum();
        logabs += d.abs().ln();
    }
    (sign, logabs)
}

fn spin_mean(h: &[DVector<f64>], start: usize, count: usize, dim: usize) -> DVector<f64> {
    let mut m = DVector::zeros(dim);
    if count == 0 {
        return m;
    }
    for hi in &h[start..start + count] {
        m += hi;
    }
    m / count as f64
}

impl DetNet {
    pub fn new(molecule: &MoleculeConfig, hidden_dims: &[usize], determinants: usize) -> Self {
        Self {
            atoms: molecule.atoms.iter().map(|a| a.coords).collect(),
            n_up: molecule.n_up,
            n_dn: molecule.n_down,
            hidden_dims: hidden_dims.to_vec(),
            determinants,
        }
    }

    pub fn n_electrons(&self) -> usize {
        self.n_up + self.n_dn
    }

    pub fn n_up(&self) -> usize {
        self.n_up
    }

    pub fn n_down(&self) -> usize {
        self.n_dn
    }

    pub fn determinants(&self) -> usize {
        self.determinants
    }

    fn feature_dim(&self) -> usize {
        4 * self.atoms.len()
    }

    /// Draw an initial parameter set. Dense weights are scaled by fan-in;
    /// envelope weights start isotropic with unit decay.
    pub fn init_params(&self, key: RngKey) -> NetworkParameters {
        let mut rng = key.rng();
        let normal = Normal::new(0.0, 1.0).unwrap();
        let natom = self.atoms.len();
        let d_last = *self.hidden_dims.last().unwrap_or(&self.feature_dim());

        let mut layers = Vec::with_capacity(self.hidden_dims.len());
        let mut d_prev = self.feature_dim();
        for &d_out in &self.hidden_dims {
            let d_in = 3 * d_prev;
            let scale = 1.0 / (d_in as f64).sqrt();
            layers.push(DenseParams {
                w: DMatrix::from_fn(d_out, d_in, |_, _| normal.sample(&mut rng) * scale),
                b: DVector::zeros(d_out),
            });
            d_prev = d_out;
        }

        let mut orbital = |n_orb: usize| OrbitalParams {
            w: DMatrix::from_fn(n_orb, d_last, |_, _| {
                normal.sample(&mut rng) / (d_last as f64).sqrt()
            }),
            b: DVector::zeros(n_orb),
            pi: DMatrix::from_element(n_orb, natom, 1.0),
            sigma: DMatrix::from_element(n_orb, natom, 1.0),
        };
        let dets = (0..self.determinants)
            .map(|_| DetParams { up: orbital(self.n_up), dn: orbital(self.n_dn) })
            .collect();

        NetworkParameters { layers, dets }
    }

    /// Gaussian initial electron positions around the nuclei.
    pub fn init_positions<R: Rng>(&self, width: f64, rng: &mut R) -> Vec<Vector3<f64>> {
        let normal = Normal::new(0.0, width).unwrap();
        (0..self.n_electrons())
            .map(|i| {
                let center = self.atoms[i % self.atoms.len()];
                center
                    + Vector3::new(
                        normal.sample(rng),
                        normal.sample(rng),
                        normal.sample(rng),
                    )
            })
            .collect()
    }

    /// Full forward pass, retaining everything backprop needs.
    pub fn forward(&self, p: &NetworkParameters, r: &[Vector3<f64>]) -> ForwardCache {
        let n = self.n_electrons();
        debug_assert_eq!(r.len(), n);
        let natom = self.atoms.len();

        let mut dists = vec![vec![0.0; natom]; n];
        let mut h0 = Vec::with_capacity(n);
        for i in 0..n {
            let mut f = DVector::zeros(self.feature_dim());
            for (a, atom) in self.atoms.iter().enumerate() {
                let d = r[i] - atom;
                let dn = d.norm();
                dists[i][a] = dn;
                f[4 * a] = d.x;
                f[4 * a + 1] = d.y;
                f[4 * a + 2] = d.z;
                f[4 * a + 3] = dn;
            }
            h0.push(f);
        }

        let mut h = vec![h0];
        let mut g = Vec::with_capacity(p.layers.len());
        for (l, layer) in p.layers.iter().enumerate() {
            let d_l = h[l][0].len();
            let m_up = spin_mean(&h[l], 0, self.n_up, d_l);
            let m_dn = spin_mean(&h[l], self.n_up, self.n_dn, d_l);
            let mut next = Vec::with_capacity(n);
            let mut g_l = Vec::with_capacity(n);
            for i in 0..n {
                let mut gi = DVector::zeros(3 * d_l);
                gi.rows_mut(0, d_l).copy_from(&h[l][i]);
                gi.rows_mut(d_l, d_l).copy_from(&m_up);
                gi.rows_mut(2 * d_l, d_l).copy_from(&m_dn);
                let z = &layer.w * &gi + &layer.b;
                next.push(z.map(f64::tanh));
                g_l.push(gi);
            }
            g.push(g_l);
            h.push(next);
        }

        let h_last = &h[p.layers.len()];
        let dets: Vec<DetCache> = p
            .dets
            .iter()
            .map(|dp| DetCache {
                up: self.spin_block(&dp.up, h_last, &dists, 0, self.n_up),
                dn: self.spin_block(&dp.dn, h_last, &dists, self.n_up, self.n_dn),
            })
            .collect();

        let (sign, logabs) = combine_determinants(&dets);
        ForwardCache { dists, h, g, dets, sign, logabs }
    }

    /// Signed log-amplitude at a configuration.
    pub fn evaluate(&self, p: &NetworkParameters, r: &[Vector3<f64>]) -> SignedLog {
        self.forward(p, r).signed()
    }

    fn spin_block(
        &self,
        op: &OrbitalParams,
        h_last: &[DVector<f64>],
        dists: &[Vec<f64>],
        offset: usize,
        ns: usize,
    ) -> BlockCache {
        let natom = self.atoms.len();
        let mut rho = DMatrix::zeros(ns, ns);
        let mut env = DMatrix::zeros(ns, ns);
        for i in 0..ns {
            let hi = &h_last[offset + i];
            for alpha in 0..ns {
                let mut lin = op.b[alpha];
                for d in 0..hi.len() {
                    lin += op.w[(alpha, d)] * hi[d];
                }
                rho[(i, alpha)] = lin;
                let mut e = 0.0;
                for a in 0..natom {
                    e += op.pi[(alpha, a)] * (-op.sigma[(alpha, a)] * dists[offset + i][a]).exp();
                }
                env[(i, alpha)] = e;
            }
        }
        let m = rho.component_mul(&env);
        let (sign, logabs) = slogdet(&m);
        BlockCache { m, rho, env, sign, logabs }
    }

    /// Parameter gradient of log|Ψ|. With `collect_curvature`, also returns
    /// per-dense-layer input/gradient second moments for the natural-
    /// gradient optimizer.
    pub fn backward_logpsi(
        &self,
        p: &NetworkParameters,
        cache: &ForwardCache,
        collect_curvature: bool,
    ) -> (NetworkGradients, Option<Vec<LayerStats>>) {
        let mut dm = Vec::with_capacity(cache.dets.len());
        for det in &cache.dets {
            let lk = det.up.logabs + det.dn.logabs;
            if cache.sign == 0.0 || !lk.is_finite() {
                dm.push((
                    DMatrix::zeros(self.n_up, self.n_up),
                    DMatrix::zeros(self.n_dn, self.n_dn),
                ));
                continue;
            }
            let mu = det.up.sign * det.dn.sign * cache.sign * (lk - cache.logabs).exp();
            dm.push((scaled_inverse_transpose(&det.up.m, mu), scaled_inverse_transpose(&det.dn.m, mu)));
        }
        self.backprop_orbitals(p, cache, &dm, collect_curvature)
    }

    /// Squared-residual loss of the orbital matrices against reference
    /// orbitals, with its parameter gradient. Used by pretraining.
    pub fn orbital_loss_grads(
        &self,
        p: &NetworkParameters,
        cache: &ForwardCache,
        up_ref: &DMatrix<f64>,
        dn_ref: &DMatrix<f64>,
    ) -> (f64, NetworkGradients) {
        let kf = self.determinants as f64;
        let mut loss = 0.0;
        let mut dm = Vec::with_capacity(cache.dets.len());
        for det in &cache.dets {
            let du = &det.up.m - up_ref;
            let dd = &det.dn.m - dn_ref;
            loss += (du.norm_squared() + dd.norm_squared()) / kf;
            dm.push((du * (2.0 / kf), dd * (2.0 / kf)));
        }
        let (grads, _) = self.backprop_orbitals(p, cache, &dm, false);
        (loss, grads)
    }

    /// Backprop from gradients w.r.t. the orbital value matrices.
    fn backprop_orbitals(
        &self,
        p: &NetworkParameters,
        cache: &ForwardCache,
        dm: &[(DMatrix<f64>, DMatrix<f64>)],
        collect_curvature: bool,
    ) -> (NetworkGradients, Option<Vec<LayerStats>>) {
        let n = self.n_electrons();
        let n_layers = p.layers.len();
        let d_last = cache.h[n_layers][0].len();
        let mut grads = p.zeros_like();
        let mut dh = vec![DVector::zeros(d_last); n];

        let h_last = &cache.h[n_layers];
        for (k, det) in cache.dets.iter().enumerate() {
            accumulate_orbital_grads(
                &p.dets[k].up,
                det,
                true,
                &dm[k].0,
                h_last,
                &cache.dists,
                0,
                &mut grads.dets[k].up,
                &mut dh,
            );
            accumulate_orbital_grads(
                &p.dets[k].dn,
                det,
                false,
                &dm[k].1,
                h_last,
                &cache.dists,
                self.n_up,
                &mut grads.dets[k].dn,
                &mut dh,
            );
        }

        // Dense stream, top down. Gradients flow through each electron's
        // own features and through the spin-channel means.
        let mut stats_rev = collect_curvature.then(Vec::new);
        for l in (0..n_layers).rev() {
            let d_l = cache.h[l][0].len();
            let d_out = cache.h[l + 1][0].len();
            let mut dw = DMatrix::zeros(d_out, 3 * d_l);
            let mut db = DVector::zeros(d_out);
            let mut a_stat = collect_curvature.then(|| DMatrix::zeros(3 * d_l + 1, 3 * d_l + 1));
            let mut g_stat = collect_curvature.then(|| DMatrix::zeros(d_out, d_out));
            let mut sum_up = DVector::zeros(d_l);
            let mut sum_dn = DVector::zeros(d_l);
            let mut dh_prev = vec![DVector::zeros(d_l); n];
            for i in 0..n {
                let delta = dh[i].zip_map(&cache.h[l + 1][i], |dv, hv| dv * (1.0 - hv * hv));
                let gi = &cache.g[l][i];
                dw += &delta * gi.transpose();
                db += &delta;
                if let (Some(a), Some(g)) = (a_stat.as_mut(), g_stat.as_mut()) {
                    let mut aug = DVector::zeros(3 * d_l + 1);
                    aug.rows_mut(0, 3 * d_l).copy_from(gi);
                    aug[3 * d_l] = 1.0;
                    *a += &aug * aug.transpose();
                    *g += &delta * delta.transpose();
                }
                let dg = p.layers[l].w.transpose() * &delta;
                dh_prev[i] += dg.rows(0, d_l);
                sum_up += dg.rows(d_l, d_l);
                sum_dn += dg.rows(2 * d_l, d_l);
            }
            if self.n_up > 0 {
                let share = sum_up / self.n_up as f64;
                for dh_i in dh_prev.iter_mut().take(self.n_up) {
                    *dh_i += &share;
                }
            }
            if self.n_dn > 0 {
                let share = sum_dn / self.n_dn as f64;
                for dh_i in dh_prev.iter_mut().skip(self.n_up) {
                    *dh_i += &share;
                }
            }
            grads.layers[l].w = dw;
            grads.layers[l].b = db;
            if let (Some(stats), Some(a), Some(g)) = (stats_rev.as_mut(), a_stat, g_stat) {
                stats.push(LayerStats { a, g });
            }
            dh = dh_prev;
        }

        let stats = stats_rev.map(|mut s| {
            s.reverse();
            s
        });
        (grads, stats)
    }
}

/// mu * M^{-T}; zeros when M is singular (the determinant weight vanishes).
fn scaled_inverse_transpose(m: &DMatrix<f64>, mu: f64) -> DMatrix<f64> {
    let n = m.nrows();
    if n == 0 {
        return DMatrix::zeros(0, 0);
    }
    match m.clone().lu().try_inverse() {
        Some(inv) => inv.transpose() * mu,
        None => DMatrix::zeros(n, n),
    }
}

fn combine_determinants(dets: &[DetCache]) -> (f64, f64) {
    let mut lmax = f64::NEG_INFINITY;
    for det in dets {
        let lk = det.up.logabs + det.dn.logabs;
        if det.up.sign * det.dn.sign != 0.0 {
            lmax = lmax.max(lk);
        }
    }
    if !lmax.is_finite() {
        return (0.0, f64::NEG_INFINITY);
    }
    let s: f64 = dets
        .iter()
        .map(|det| {
            let sign = det.up.sign * det.dn.sign;
            if sign == 0.0 {
                0.0
            } else {
                sign * ((det.up.logabs + det.dn.logabs) - lmax).exp()
            }
        })
        .sum();
    if s == 0.0 {
        (0.0, f64::NEG_INFINITY)
    } else {
        (s.signum(), lmax + s.abs().ln())
    }
}

#[allow(clippy::too_many_arguments)]
fn accumulate_orbital_grads(
    op: &OrbitalParams,
    det: &DetCache,
    up: bool,
    dmb: &DMatrix<f64>,
    h_last: &[DVector<f64>],
    dists: &[Vec<f64>],
    offset: usize,
    gop: &mut OrbitalParams,
    dh_last: &mut [DVector<f64>],
) {
    let blk = if up { &det.up } else { &det.dn };
    let ns = blk.m.nrows();
    let natom = op.pi.ncols();
    for i in 0..ns {
        let gi = offset + i;
        let hi = &h_last[gi];
        for alpha in 0..ns {
            let c = dmb[(i, alpha)];
            if c == 0.0 {
                continue;
            }
            let e = blk.env[(i, alpha)];
            let rho = blk.rho[(i, alpha)];
            let ce = c * e;
            for d in 0..hi.len() {
                gop.w[(alpha, d)] += ce * hi[d];
                dh_last[gi][d] += ce * op.w[(alpha, d)];
            }
            gop.b[alpha] += ce;
            let cr = c * rho;
            for a in 0..natom {
                let dist = dists[gi][a];
                let ex = (-op.sigma[(alpha, a)] * dist).exp();
                gop.pi[(alpha, a)] += cr * ex;
                gop.sigma[(alpha, a)] -= cr * op.pi[(alpha, a)] * dist * ex;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::{Atom, MoleculeConfig};
    use approx::assert_relative_eq;

    fn h2_molecule() -> MoleculeConfig {
        let atoms = vec![
            Atom::new("H", Vector3::new(0.0, 0.0, -0.7)).unwrap(),
            Atom::new("H", Vector3::new(0.0, 0.0, 0.7)).unwrap(),
        ];
        MoleculeConfig::with_charge_and_spin(atoms, 0, 0).unwrap()
    }

    fn li_molecule() -> MoleculeConfig {
        let atoms = vec![Atom::new("Li", Vector3::zeros()).unwrap()];
        MoleculeConfig::with_charge_and_spin(atoms, 0, 1).unwrap()
    }

    #[test]
    fn test_evaluate_is_finite_and_deterministic() {
        let mol = h2_molecule();
        let net = DetNet::new(&mol, &[6, 4], 2);
        let params = net.init_params(RngKey::new(1));
        let mut rng = RngKey::new(2).rng();
        let r = net.init_positions(0.8, &mut rng);
        let a = net.evaluate(&params, &r);
        let b = net.evaluate(&params, &r);
        assert!(a.logabs.is_finite());
        assert_eq!(a, b);
    }

    #[test]
    fn test_empty_down_channel() {
        let atoms = vec![Atom::new("H", Vector3::zeros()).unwrap()];
        let mol = MoleculeConfig::with_charge_and_spin(atoms, 0, 1).unwrap();
        let net = DetNet::new(&mol, &[4], 2);
        let params = net.init_params(RngKey::new(3));
        let r = vec![Vector3::new(0.3, -0.2, 0.5)];
        assert!(net.evaluate(&params, &r).logabs.is_finite());
    }

    #[test]
    fn test_same_spin_swap_flips_sign() {
        let mol = li_molecule();
        let net = DetNet::new(&mol, &[6, 4], 2);
        let params = net.init_params(RngKey::new(4));
        let mut rng = RngKey::new(5).rng();
        let r = net.init_positions(0.8, &mut rng);
        let orig = net.evaluate(&params, &r);
        // Electrons 0 and 1 are both spin-up.
        let mut swapped = r.clone();
        swapped.swap(0, 1);
        let perm = net.evaluate(&params, &swapped);
        assert_relative_eq!(orig.logabs, perm.logabs, epsilon = 1e-10);
        assert_relative_eq!(orig.sign, -perm.sign);
    }

    #[test]
    fn test_backprop_matches_finite_differences() {
        let mol = h2_molecule();
        let net = DetNet::new(&mol, &[6, 4], 2);
        let params = net.init_params(RngKey::new(6));
        let mut rng = RngKey::new(7).rng();
        let r = net.init_positions(0.8, &mut rng);

        let cache = net.forward(&params, &r);
        let (grads, _) = net.backward_logpsi(&params, &cache, false);
        let grads_flat = grads.to_flat();

        let h = 1e-5;
        let flat = params.to_flat();
        let mut probe = params.clone();
        for idx in 0..flat.len() {
            let mut shifted = flat.clone();
            shifted[idx] = flat[idx] + h;
            probe.set_from_flat(&shifted);
            let fp = net.evaluate(&probe, &r).logabs;
            shifted[idx] = flat[idx] - h;
            probe.set_from_flat(&shifted);
            let fm = net.evaluate(&probe, &r).logabs;
            let fd = (fp - fm) / (2.0 * h);
            assert_relative_eq!(grads_flat[idx], fd, epsilon = 1e-6, max_relative = 1e-4);
        }
    }

    #[test]
    fn test_combine_determinants_matches_direct_sum() {
        let block = |sign: f64, logabs: f64| BlockCache {
            m: DMatrix::zeros(0, 0),
            rho: DMatrix::zeros(0, 0),
            env: DMatrix::zeros(0, 0),
            sign,
            logabs,
        };
        // det values 3e^-2, -e^-2 and a vanished determinant.
        let dets = vec![
            DetCache { up: block(1.0, -2.0 + 3.0f64.ln()), dn: block(1.0, 0.0) },
            DetCache { up: block(-1.0, -2.0), dn: block(1.0, 0.0) },
            DetCache { up: block(0.0, f64::NEG_INFINITY), dn: block(1.0, 0.0) },
        ];
        let (sign, logabs) = combine_determinants(&dets);
        let direct = 3.0 * (-2.0f64).exp() - (-2.0f64).exp();
        assert_relative_eq!(sign, 1.0);
        assert_relative_eq!(logabs, direct.ln(), epsilon = 1e-12);
    }

    #[test]
    fn test_curvature_stats_shapes() {
        let mol = li_molecule();
        let net = DetNet::new(&mol, &[6, 4], 1);
        let params = net.init_params(RngKey::new(8));
        let mut rng = RngKey::new(9).rng();
        let r = net.init_positions(0.8, &mut rng);
        let cache = net.forward(&params, &r);
        let (_, stats) = net.backward_logpsi(&params, &cache, true);
        let stats = stats.unwrap();
        assert_eq!(stats.len(), 2);
        // Layer 0 input is 3 * 4 * natom = 12 features, augmented by one.
        assert_eq!(stats[0].a.nrows(), 13);
        assert_eq!(stats[0].g.nrows(), 6);
        assert_eq!(stats[1].a.nrows(), 19);
        assert_eq!(stats[1].g.nrows(), 4);
    }
}
