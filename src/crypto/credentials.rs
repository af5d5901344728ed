//! Keyed-verification anonymous credentials.
//!
//! The coordinator holds a MAC key and issues MACs over Pedersen commitments
//! `Ma = a·Gg + r·Gh` to amount (or vsize) attributes. A participant later
//! re-randomizes an issued credential into a presentation the coordinator can
//! check with its key but cannot link back to the issuance.
//!
//! Every request carries one proof batch covering, in this order:
//! * one show proof per presented credential,
//! * one balance proof tying `Σ presented − Σ requested` to the public delta,
//! * one bit proof per bit of every requested value (range proof).
//!
//! Presenting a credential reveals its serial number `S = r·Gs`, which the
//! issuer remembers so a credential can be spent only once.

use super::group::{
    random_scalar, scalar_from_i64, scalar_from_u64, scalar_to_bytes, serde_scalar, GroupElement,
    Scalar,
};
use super::transcript::Transcript;
use super::zk::{self, Equation, Knowledge, Proof, ProofError, Statement};
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::OnceLock;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CredentialError {
    #[error("expected {expected} requested credentials, got {got}")]
    WrongNumberOfRequested { expected: usize, got: usize },
    #[error("at most {max} credentials may be presented, got {got}")]
    TooManyPresented { max: usize, got: usize },
    #[error("malformed credential request")]
    Malformed,
    #[error("credential already spent")]
    AlreadySpent,
    #[error("request would make the issuer balance negative")]
    NegativeBalance,
    #[error("proof invalid")]
    InvalidProof,
    #[error("value {0} is outside the credential range")]
    ValueOutOfRange(u64),
    #[error("credential amounts overflow")]
    Overflow,
    #[error("issuer returned {got} credentials, expected {expected}")]
    WrongNumberOfIssued { expected: usize, got: usize },
    #[error("issuer proof invalid")]
    InvalidIssuerProof,
    #[error("proof construction failed: {0}")]
    Proof(#[from] ProofError),
}

// ── Generators ──────────────────────────────────────────────────────────

pub struct Generators {
    pub g: GroupElement,
    pub gw: GroupElement,
    pub gwp: GroupElement,
    pub gx0: GroupElement,
    pub gx1: GroupElement,
    pub gv: GroupElement,
    pub gg: GroupElement,
    pub gh: GroupElement,
    pub ga: GroupElement,
    pub gs: GroupElement,
}

pub fn generators() -> &'static Generators {
    static GENERATORS: OnceLock<Generators> = OnceLock::new();
    GENERATORS.get_or_init(|| Generators {
        g: GroupElement::generator(),
        gw: GroupElement::hash_to_curve(b"Gw"),
        gwp: GroupElement::hash_to_curve(b"Gwp"),
        gx0: GroupElement::hash_to_curve(b"Gx0"),
        gx1: GroupElement::hash_to_curve(b"Gx1"),
        gv: GroupElement::hash_to_curve(b"GV"),
        gg: GroupElement::hash_to_curve(b"Gg"),
        gh: GroupElement::hash_to_curve(b"Gh"),
        ga: GroupElement::hash_to_curve(b"Ga"),
        gs: GroupElement::hash_to_curve(b"Gs"),
    })
}

/// Number of bits needed to range-prove values up to `max_amount`.
pub fn range_bits(max_amount: u64) -> usize {
    ((64 - max_amount.leading_zeros()) as usize).max(1)
}

fn pow2(i: usize) -> Scalar {
    scalar_from_u64(1u64 << i)
}

// ── Issuer keys and MACs ────────────────────────────────────────────────

#[derive(Clone)]
pub struct CredentialIssuerSecretKey {
    w: Scalar,
    wp: Scalar,
    x0: Scalar,
    x1: Scalar,
    ya: Scalar,
}

impl fmt::Debug for CredentialIssuerSecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CredentialIssuerSecretKey(..)")
    }
}

impl CredentialIssuerSecretKey {
    pub fn random<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self {
            w: random_scalar(rng),
            wp: random_scalar(rng),
            x0: random_scalar(rng),
            x1: random_scalar(rng),
            ya: random_scalar(rng),
        }
    }

    pub fn compute_parameters(&self) -> CredentialIssuerParameters {
        let g = generators();
        CredentialIssuerParameters {
            cw: g.gw * self.w + g.gwp * self.wp,
            i: g.gv - (g.gx0 * self.x0 + g.gx1 * self.x1 + g.ga * self.ya),
        }
    }

    fn compute_mac<R: RngCore + CryptoRng>(&self, ma: GroupElement, rng: &mut R) -> Mac {
        let t = random_scalar(rng);
        let u = mac_generator(&t);
        let v = generators().gw * self.w + u * self.x0 + u * (self.x1 * t) + ma * self.ya;
        Mac { t, v }
    }

    fn witness(&self) -> Vec<Scalar> {
        vec![self.w, self.wp, self.x0, self.x1, self.ya]
    }

    /// `Z` recomputed from a presentation with the secret key.
    fn presentation_z(&self, p: &CredentialPresentation) -> GroupElement {
        p.cv - (generators().gw * self.w + p.cx0 * self.x0 + p.cx1 * self.x1 + p.ca * self.ya)
    }
}

/// Public counterpart of the issuer key, published with every round.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialIssuerParameters {
    pub cw: GroupElement,
    pub i: GroupElement,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mac {
    #[serde(with = "serde_scalar")]
    pub t: Scalar,
    pub v: GroupElement,
}

impl Mac {
    pub fn u(&self) -> GroupElement {
        mac_generator(&self.t)
    }
}

fn mac_generator(t: &Scalar) -> GroupElement {
    let mut label = b"wabisabi/mac-u/".to_vec();
    label.extend_from_slice(&scalar_to_bytes(t));
    GroupElement::hash_to_curve(&label)
}

// ── Wire types ──────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuanceRequest {
    pub ma: GroupElement,
    pub bit_commitments: Vec<GroupElement>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialPresentation {
    pub ca: GroupElement,
    pub cx0: GroupElement,
    pub cx1: GroupElement,
    pub cv: GroupElement,
    pub s: GroupElement,
}

impl CredentialPresentation {
    pub fn serial_number(&self) -> [u8; 33] {
        self.s.to_bytes()
    }

    fn has_identity(&self) -> bool {
        [self.ca, self.cx0, self.cx1, self.cv, self.s]
            .iter()
            .any(GroupElement::is_identity)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealCredentialsRequest {
    pub delta: i64,
    pub presented: Vec<CredentialPresentation>,
    pub requested: Vec<IssuanceRequest>,
    pub proofs: Vec<Proof>,
}

impl RealCredentialsRequest {
    pub fn is_null_presentation(&self) -> bool {
        self.presented.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialsResponse {
    pub issued: Vec<Mac>,
    pub proofs: Vec<Proof>,
}

// ── Statements ──────────────────────────────────────────────────────────

fn request_transcript(parameters: &CredentialIssuerParameters, delta: i64) -> Transcript {
    let mut transcript = Transcript::new(b"wabisabi/credential-request");
    transcript.commit_bytes(b"issuer-cw", &parameters.cw.to_bytes());
    transcript.commit_bytes(b"issuer-i", &parameters.i.to_bytes());
    transcript.commit_bytes(b"delta", &delta.to_le_bytes());
    transcript
}

fn issuance_transcript(parameters: &CredentialIssuerParameters) -> Transcript {
    let mut transcript = Transcript::new(b"wabisabi/issuance");
    transcript.commit_bytes(b"issuer-cw", &parameters.cw.to_bytes());
    transcript.commit_bytes(b"issuer-i", &parameters.i.to_bytes());
    transcript
}

/// Witness: `(z, z0 = -t·z, t, a, r)`.
fn show_statement(
    parameters: &CredentialIssuerParameters,
    z: GroupElement,
    p: &CredentialPresentation,
) -> Result<Statement, ProofError> {
    let g = generators();
    let o = GroupElement::IDENTITY;
    Statement::new(vec![
        Equation::new(z, vec![parameters.i, o, o, o, o]),
        Equation::new(p.cx1, vec![g.gx1, g.gx0, p.cx0, o, o]),
        Equation::new(p.ca, vec![g.ga, o, o, g.gg, g.gh]),
        Equation::new(p.s, vec![o, o, o, o, g.gs]),
    ])
}

/// Witness: `(Σz, Σr_presented − Σr_requested)`.
fn balance_statement(b: GroupElement) -> Result<Statement, ProofError> {
    let g = generators();
    Statement::new(vec![Equation::new(b, vec![g.ga, g.gh])])
}

/// Witness: `(b, r, b·r)`; the second equation forces `b ∈ {0, 1}`.
fn bit_statement(commitment: GroupElement) -> Result<Statement, ProofError> {
    let g = generators();
    let o = GroupElement::IDENTITY;
    Statement::new(vec![
        Equation::new(commitment, vec![g.gg, g.gh, o]),
        Equation::new(o, vec![commitment - g.gg, o, -g.gh]),
    ])
}

/// Witness: the issuer key `(w, wp, x0, x1, ya)`.
fn issuance_statement(
    parameters: &CredentialIssuerParameters,
    mac: &Mac,
    ma: GroupElement,
) -> Result<Statement, ProofError> {
    let g = generators();
    let o = GroupElement::IDENTITY;
    let u = mac.u();
    Statement::new(vec![
        Equation::new(parameters.cw, vec![g.gw, g.gwp, o, o, o]),
        Equation::new(g.gv - parameters.i, vec![o, o, g.gx0, g.gx1, g.ga]),
        Equation::new(mac.v, vec![g.gw, o, u, u * mac.t, ma]),
    ])
}

fn balance_point(delta: i64, presented: &[CredentialPresentation], requested: &[IssuanceRequest]) -> GroupElement {
    let presented_sum: GroupElement = presented.iter().map(|p| p.ca).sum();
    let requested_sum: GroupElement = requested.iter().map(|r| r.ma).sum();
    presented_sum + generators().gg * scalar_from_i64(delta) - requested_sum
}

// ── Issuer ──────────────────────────────────────────────────────────────

/// A request that passed every check; applying it is infallible.
#[derive(Debug)]
pub struct PreparedIssuance {
    serial_numbers: Vec<[u8; 33]>,
    delta: i64,
    response: CredentialsResponse,
}

pub struct CredentialIssuer {
    secret_key: CredentialIssuerSecretKey,
    parameters: CredentialIssuerParameters,
    credential_count: usize,
    range_bits: usize,
    serial_numbers: HashSet<[u8; 33]>,
    balance: i128,
}

impl CredentialIssuer {
    pub fn new(secret_key: CredentialIssuerSecretKey, credential_count: usize, max_amount: u64) -> Self {
        let parameters = secret_key.compute_parameters();
        Self {
            secret_key,
            parameters,
            credential_count,
            range_bits: range_bits(max_amount),
            serial_numbers: HashSet::new(),
            balance: 0,
        }
    }

    pub fn parameters(&self) -> &CredentialIssuerParameters {
        &self.parameters
    }

    /// Net value issued minus value presented so far. Never negative.
    pub fn balance(&self) -> i128 {
        self.balance
    }

    pub fn handle_request<R: RngCore + CryptoRng>(
        &mut self,
        request: &RealCredentialsRequest,
        rng: &mut R,
    ) -> Result<CredentialsResponse, CredentialError> {
        let prepared = self.prepare(request, rng)?;
        Ok(self.commit(prepared))
    }

    /// Validate a request and compute the MACs without touching issuer state.
    pub fn prepare<R: RngCore + CryptoRng>(
        &self,
        request: &RealCredentialsRequest,
        rng: &mut R,
    ) -> Result<PreparedIssuance, CredentialError> {
        let k = self.credential_count;
        if request.requested.len() != k {
            return Err(CredentialError::WrongNumberOfRequested {
                expected: k,
                got: request.requested.len(),
            });
        }
        if request.presented.len() > k {
            return Err(CredentialError::TooManyPresented {
                max: k,
                got: request.presented.len(),
            });
        }
        if request.presented.iter().any(CredentialPresentation::has_identity) {
            return Err(CredentialError::Malformed);
        }
        for req in &request.requested {
            if req.bit_commitments.len() != self.range_bits {
                return Err(CredentialError::Malformed);
            }
            let recomposed: GroupElement = req
                .bit_commitments
                .iter()
                .enumerate()
                .map(|(i, b)| *b * pow2(i))
                .sum();
            if recomposed != req.ma {
                return Err(CredentialError::Malformed);
            }
        }

        let mut serial_numbers = Vec::with_capacity(request.presented.len());
        for p in &request.presented {
            let serial = p.serial_number();
            if self.serial_numbers.contains(&serial) || serial_numbers.contains(&serial) {
                return Err(CredentialError::AlreadySpent);
            }
            serial_numbers.push(serial);
        }

        if self.balance + (request.delta as i128) < 0 {
            return Err(CredentialError::NegativeBalance);
        }

        let mut statements = Vec::new();
        for p in &request.presented {
            let z = self.secret_key.presentation_z(p);
            statements.push(show_statement(&self.parameters, z, p)?);
        }
        statements.push(balance_statement(balance_point(
            request.delta,
            &request.presented,
            &request.requested,
        ))?);
        for req in &request.requested {
            for commitment in &req.bit_commitments {
                statements.push(bit_statement(*commitment)?);
            }
        }

        let transcript = request_transcript(&self.parameters, request.delta);
        if !zk::verify(transcript, &statements, &request.proofs) {
            return Err(CredentialError::InvalidProof);
        }

        let mut issued = Vec::with_capacity(k);
        let mut knowledge = Vec::with_capacity(k);
        for req in &request.requested {
            let mac = self.secret_key.compute_mac(req.ma, rng);
            let statement = issuance_statement(&self.parameters, &mac, req.ma)?;
            knowledge.push(Knowledge::new(statement, self.secret_key.witness())?);
            issued.push(mac);
        }
        let proofs = zk::prove(issuance_transcript(&self.parameters), knowledge, rng);

        Ok(PreparedIssuance {
            serial_numbers,
            delta: request.delta,
            response: CredentialsResponse { issued, proofs },
        })
    }

    pub fn commit(&mut self, prepared: PreparedIssuance) -> CredentialsResponse {
        self.serial_numbers.extend(prepared.serial_numbers);
        self.balance += prepared.delta as i128;
        prepared.response
    }
}

// ── Client ──────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub value: u64,
    #[serde(with = "serde_scalar")]
    pub randomness: Scalar,
    pub mac: Mac,
}

impl Credential {
    pub fn ma(&self) -> GroupElement {
        let g = generators();
        g.gg * scalar_from_u64(self.value) + g.gh * self.randomness
    }

    fn present(
        &self,
        parameters: &CredentialIssuerParameters,
        z: Scalar,
    ) -> Result<(CredentialPresentation, Knowledge), CredentialError> {
        let g = generators();
        let u = self.mac.u();
        let t = self.mac.t;
        let presentation = CredentialPresentation {
            ca: g.ga * z + self.ma(),
            cx0: g.gx0 * z + u,
            cx1: g.gx1 * z + u * t,
            cv: g.gv * z + self.mac.v,
            s: g.gs * self.randomness,
        };
        let statement = show_statement(parameters, parameters.i * z, &presentation)?;
        let witness = vec![z, -(t * z), t, scalar_from_u64(self.value), self.randomness];
        Ok((presentation, Knowledge::new(statement, witness)?))
    }
}

/// Client-side secrets needed to turn a response into credentials.
#[derive(Debug)]
pub struct CredentialsResponseValidation {
    requested: Vec<(u64, Scalar, GroupElement)>,
}

#[derive(Clone, Debug)]
pub struct WabiSabiClient {
    parameters: CredentialIssuerParameters,
    credential_count: usize,
    range_bits: usize,
}

impl WabiSabiClient {
    pub fn new(parameters: CredentialIssuerParameters, credential_count: usize, max_amount: u64) -> Self {
        Self {
            parameters,
            credential_count,
            range_bits: range_bits(max_amount),
        }
    }

    pub fn credential_count(&self) -> usize {
        self.credential_count
    }

    pub fn create_request_for_zero_amount<R: RngCore + CryptoRng>(
        &self,
        rng: &mut R,
    ) -> Result<(RealCredentialsRequest, CredentialsResponseValidation), CredentialError> {
        let zeros = vec![0u64; self.credential_count];
        self.create_request(&zeros, &[], rng)
    }

    /// Request credentials for `amounts`, presenting `presented`. The delta is
    /// `Σ amounts − Σ presented` and becomes public.
    pub fn create_request<R: RngCore + CryptoRng>(
        &self,
        amounts: &[u64],
        presented: &[Credential],
        rng: &mut R,
    ) -> Result<(RealCredentialsRequest, CredentialsResponseValidation), CredentialError> {
        if amounts.len() != self.credential_count {
            return Err(CredentialError::WrongNumberOfRequested {
                expected: self.credential_count,
                got: amounts.len(),
            });
        }
        if presented.len() > self.credential_count {
            return Err(CredentialError::TooManyPresented {
                max: self.credential_count,
                got: presented.len(),
            });
        }
        let requested_total: u128 = amounts.iter().map(|a| *a as u128).sum();
        let presented_total: u128 = presented.iter().map(|c| c.value as u128).sum();
        let delta = i64::try_from(requested_total as i128 - presented_total as i128)
            .map_err(|_| CredentialError::Overflow)?;

        let g = generators();
        let mut knowledge = Vec::new();
        let mut presentations = Vec::with_capacity(presented.len());
        let mut z_total = Scalar::ZERO;
        let mut r_delta = Scalar::ZERO;
        for credential in presented {
            let z = random_scalar(rng);
            let (presentation, k) = credential.present(&self.parameters, z)?;
            z_total += z;
            r_delta += credential.randomness;
            presentations.push(presentation);
            knowledge.push(k);
        }

        let mut requested = Vec::with_capacity(amounts.len());
        let mut secrets = Vec::with_capacity(amounts.len());
        let mut bit_knowledge = Vec::new();
        for &amount in amounts {
            if self.range_bits < 64 && amount >> self.range_bits != 0 {
                return Err(CredentialError::ValueOutOfRange(amount));
            }
            let mut randomness = Scalar::ZERO;
            let mut bit_commitments = Vec::with_capacity(self.range_bits);
            for i in 0..self.range_bits {
                let bit = scalar_from_u64((amount >> i) & 1);
                let r = random_scalar(rng);
                let commitment = g.gg * bit + g.gh * r;
                bit_knowledge.push(Knowledge::new(bit_statement(commitment)?, vec![bit, r, bit * r])?);
                bit_commitments.push(commitment);
                randomness += r * pow2(i);
            }
            let ma = g.gg * scalar_from_u64(amount) + g.gh * randomness;
            r_delta -= randomness;
            requested.push(IssuanceRequest { ma, bit_commitments });
            secrets.push((amount, randomness, ma));
        }

        let b = balance_point(delta, &presentations, &requested);
        knowledge.push(Knowledge::new(balance_statement(b)?, vec![z_total, r_delta])?);
        knowledge.extend(bit_knowledge);

        let proofs = zk::prove(request_transcript(&self.parameters, delta), knowledge, rng);
        Ok((
            RealCredentialsRequest {
                delta,
                presented: presentations,
                requested,
                proofs,
            },
            CredentialsResponseValidation { requested: secrets },
        ))
    }

    pub fn handle_response(
        &self,
        response: &CredentialsResponse,
        validation: CredentialsResponseValidation,
    ) -> Result<Vec<Credential>, CredentialError> {
        if response.issued.len() != validation.requested.len() {
            return Err(CredentialError::WrongNumberOfIssued {
                expected: validation.requested.len(),
                got: response.issued.len(),
            });
        }
        let statements = response
            .issued
            .iter()
            .zip(&validation.requested)
            .map(|(mac, (_, _, ma))| issuance_statement(&self.parameters, mac, *ma))
            .collect::<Result<Vec<_>, _>>()?;
        if !zk::verify(issuance_transcript(&self.parameters), &statements, &response.proofs) {
            return Err(CredentialError::InvalidIssuerProof);
        }
        Ok(response
            .issued
            .iter()
            .zip(validation.requested)
            .map(|(mac, (value, randomness, _))| Credential {
                value,
                randomness,
                mac: *mac,
            })
            .collect())
    }
}

/// Unspent credentials held by one participant connection.
#[derive(Clone, Debug, Default)]
pub struct CredentialPool {
    credentials: Vec<Credential>,
}

impl CredentialPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Zero-valued credentials carry nothing and are dropped.
    pub fn add(&mut self, credentials: impl IntoIterator<Item = Credential>) {
        self.credentials
            .extend(credentials.into_iter().filter(|c| c.value > 0));
        self.credentials.sort_by(|a, b| b.value.cmp(&a.value));
    }

    /// Take up to `count` credentials, largest first.
    pub fn take(&mut self, count: usize) -> Vec<Credential> {
        let n = count.min(self.credentials.len());
        self.credentials.drain(..n).collect()
    }

    /// Take the fewest largest credentials (at most `max_count`) covering `value`.
    /// Leaves the pool untouched when that is impossible.
    pub fn take_with_total(&mut self, value: u64, max_count: usize) -> Option<Vec<Credential>> {
        let mut total = 0u64;
        let mut n = 0;
        for c in self.credentials.iter().take(max_count) {
            if total >= value {
                break;
            }
            total = total.saturating_add(c.value);
            n += 1;
        }
        if total < value {
            return None;
        }
        Some(self.credentials.drain(..n).collect())
    }

    pub fn total(&self) -> u64 {
        self.credentials.iter().map(|c| c.value).sum()
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    const MAX: u64 = 1 << 20;

    fn setup() -> (CredentialIssuer, WabiSabiClient) {
        let sk = CredentialIssuerSecretKey::random(&mut OsRng);
        let issuer = CredentialIssuer::new(sk, 2, MAX);
        let client = WabiSabiClient::new(*issuer.parameters(), 2, MAX);
        (issuer, client)
    }

    fn issue(issuer: &mut CredentialIssuer, client: &WabiSabiClient, amounts: &[u64]) -> Vec<Credential> {
        let (request, validation) = client.create_request(amounts, &[], &mut OsRng).unwrap();
        let response = issuer.handle_request(&request, &mut OsRng).unwrap();
        client.handle_response(&response, validation).unwrap()
    }

    #[test]
    fn issue_then_present() {
        let (mut issuer, client) = setup();
        let creds = issue(&mut issuer, &client, &[700, 300]);
        assert_eq!(issuer.balance(), 1000);
        assert_eq!(creds.iter().map(|c| c.value).sum::<u64>(), 1000);

        let (request, validation) = client.create_request(&[250, 0], &creds, &mut OsRng).unwrap();
        assert_eq!(request.delta, -750);
        let response = issuer.handle_request(&request, &mut OsRng).unwrap();
        let change = client.handle_response(&response, validation).unwrap();
        assert_eq!(change[0].value, 250);
        assert_eq!(issuer.balance(), 250);
    }

    #[test]
    fn zero_amount_request_is_accepted() {
        let (mut issuer, client) = setup();
        let (request, validation) = client.create_request_for_zero_amount(&mut OsRng).unwrap();
        assert!(request.is_null_presentation());
        let response = issuer.handle_request(&request, &mut OsRng).unwrap();
        let creds = client.handle_response(&response, validation).unwrap();
        assert!(creds.iter().all(|c| c.value == 0));
        assert_eq!(issuer.balance(), 0);
    }

    #[test]
    fn double_spend_is_rejected() {
        let (mut issuer, client) = setup();
        let creds = issue(&mut issuer, &client, &[500, 500]);

        let (first, _) = client.create_request(&[0, 0], &creds[..1], &mut OsRng).unwrap();
        issuer.handle_request(&first, &mut OsRng).unwrap();

        let (again, _) = client.create_request(&[0, 0], &creds[..1], &mut OsRng).unwrap();
        assert_eq!(
            issuer.handle_request(&again, &mut OsRng).unwrap_err(),
            CredentialError::AlreadySpent
        );
    }

    #[test]
    fn negative_balance_is_rejected() {
        let (mut issuer, client) = setup();
        let (request, _) = client.create_request(&[0, 0], &[], &mut OsRng).unwrap();
        let mut forged = request;
        forged.delta = -1;
        assert_eq!(
            issuer.handle_request(&forged, &mut OsRng).unwrap_err(),
            CredentialError::NegativeBalance
        );
    }

    #[test]
    fn tampered_delta_fails_the_balance_proof() {
        let (mut issuer, client) = setup();
        let (mut request, _) = client.create_request(&[100, 0], &[], &mut OsRng).unwrap();
        request.delta = 101;
        assert_eq!(
            issuer.handle_request(&request, &mut OsRng).unwrap_err(),
            CredentialError::InvalidProof
        );
        assert_eq!(issuer.balance(), 0);
    }

    #[test]
    fn credential_from_other_issuer_is_rejected() {
        let (mut issuer_a, client_a) = setup();
        let (mut issuer_b, _) = setup();
        let creds = issue(&mut issuer_a, &client_a, &[10, 0]);
        let client_b = WabiSabiClient::new(*issuer_b.parameters(), 2, MAX);
        issue(&mut issuer_b, &client_b, &[10, 0]);

        let (request, _) = client_b.create_request(&[0, 0], &creds[..1], &mut OsRng).unwrap();
        assert_eq!(
            issuer_b.handle_request(&request, &mut OsRng).unwrap_err(),
            CredentialError::InvalidProof
        );
    }

    #[test]
    fn out_of_range_values_are_refused_by_the_client() {
        let (_, client) = setup();
        assert_eq!(
            client.create_request(&[MAX * 4, 0], &[], &mut OsRng).unwrap_err(),
            CredentialError::ValueOutOfRange(MAX * 4)
        );
    }

    #[test]
    fn wrong_request_count_is_rejected() {
        let (mut issuer, client) = setup();
        let (mut request, _) = client.create_request(&[1, 2], &[], &mut OsRng).unwrap();
        request.requested.pop();
        assert!(matches!(
            issuer.handle_request(&request, &mut OsRng),
            Err(CredentialError::WrongNumberOfRequested { expected: 2, got: 1 })
        ));
    }

    #[test]
    fn forged_issuer_proof_is_detected() {
        let (mut issuer, client) = setup();
        let (request, validation) = client.create_request(&[5, 0], &[], &mut OsRng).unwrap();
        let mut response = issuer.handle_request(&request, &mut OsRng).unwrap();
        response.issued.swap(0, 1);
        assert_eq!(
            client.handle_response(&response, validation).unwrap_err(),
            CredentialError::InvalidIssuerProof
        );
    }

    #[test]
    fn pool_takes_largest_first() {
        let (mut issuer, client) = setup();
        let mut pool = CredentialPool::new();
        pool.add(issue(&mut issuer, &client, &[30, 0]));
        pool.add(issue(&mut issuer, &client, &[50, 20]));
        assert_eq!(pool.len(), 3);
        assert_eq!(pool.total(), 100);

        assert!(pool.take_with_total(200, 2).is_none());
        assert_eq!(pool.len(), 3);

        let taken = pool.take_with_total(60, 2).unwrap();
        assert_eq!(taken.iter().map(|c| c.value).collect::<Vec<_>>(), vec![50, 30]);
        assert_eq!(pool.take(5).len(), 1);
        assert!(pool.is_empty());
    }
}
