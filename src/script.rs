//! Stack-machine authorization of transaction inputs.
//!
//! A script is a byte sequence of data pushes and executed opcodes. An input
//! is authorized by running its unlocking script concatenated with the
//! referenced output's locking script and requiring a truthy top-of-stack
//! value at completion. Pay-to-script-hash outputs add a second phase that
//! executes the redeem script carried in the unlocking script.

use secp256k1::ecdsa::Signature;
use secp256k1::{Message, PublicKey, Secp256k1, VerifyOnly};
use smallvec::SmallVec;
use tracing::debug;

use crate::error::ScriptError;
use crate::opcodes::*;
use crate::types::{hash160, Address, Hash, Transaction};

type Result<T> = std::result::Result<T, ScriptError>;

/// Stack operand.
pub type Operand = Vec<u8>;

const P2PKH_SCRIPT_LEN: usize = 25;
const P2SH_SCRIPT_LEN: usize = 23;
const PUB_KEY_HASH_LEN: usize = 20;

/// Maximum operand width accepted by the arithmetic opcodes.
const MAX_NUM_OPERAND_LEN: usize = 4;

thread_local! {
    // Context creation dominates single verifications; one per thread.
    static SECP256K1: Secp256k1<VerifyOnly> = Secp256k1::verification_only();
}

/// Script byte sequence with builder-style construction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Script(Vec<u8>);

/// Locking script paying to the given pubkey hash.
pub fn pay_to_pub_key_hash_script(pub_key_hash: &[u8]) -> Script {
    Script::new()
        .add_op_code(OP_DUP)
        .add_op_code(OP_HASH160)
        .add_operand(pub_key_hash)
        .add_op_code(OP_EQUALVERIFY)
        .add_op_code(OP_CHECKSIG)
}

/// Locking script committing to a redeem script hash.
pub fn pay_to_script_hash_script(script_hash: &[u8]) -> Script {
    Script::new()
        .add_op_code(OP_HASH160)
        .add_operand(script_hash)
        .add_op_code(OP_EQUAL)
}

/// Unlocking script carrying a DER signature and the signing public key.
pub fn signature_script(sig_der: &[u8], pub_key: &[u8]) -> Script {
    Script::new().add_operand(sig_der).add_operand(pub_key)
}

/// Standard coinbase unlocking script: the block height plus an extra-nonce
/// slot.
pub fn standard_coinbase_signature_script(height: u32) -> Script {
    Script::new()
        .add_operand(&script_num_bytes(i64::from(height)))
        .add_operand(&script_num_bytes(0))
}

/// Token-issue locking script: a P2PKH prefix binding the holder, followed
/// by the token name and an 8-byte big-endian total supply.
pub fn issue_token_script(pub_key_hash: &[u8], name: &str, total_supply: u64) -> Script {
    pay_to_pub_key_hash_script(pub_key_hash)
        .add_op_code(OP_CODESEPARATOR)
        .add_operand(name.as_bytes())
        .add_operand(&total_supply.to_be_bytes())
}

/// Token-transfer locking script: a P2PKH prefix binding the recipient,
/// followed by an 8-byte big-endian amount.
pub fn transfer_token_script(pub_key_hash: &[u8], amount: u64) -> Script {
    pay_to_pub_key_hash_script(pub_key_hash)
        .add_op_code(OP_CODESEPARATOR)
        .add_operand(&amount.to_be_bytes())
}

impl Script {
    pub fn new() -> Self {
        Script(Vec::new())
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Script(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn add_op_code(mut self, op: u8) -> Self {
        self.0.push(op);
        self
    }

    /// Append a data push with the smallest sufficient push encoding.
    pub fn add_operand(mut self, operand: &[u8]) -> Self {
        let len = operand.len();
        if len < usize::from(OP_PUSHDATA1) {
            self.0.push(len as u8);
        } else if len <= 0xff {
            self.0.push(OP_PUSHDATA1);
            self.0.push(len as u8);
        } else if len <= 0xffff {
            self.0.push(OP_PUSHDATA2);
            self.0.extend_from_slice(&(len as u16).to_le_bytes());
        } else {
            self.0.push(OP_PUSHDATA4);
            self.0.extend_from_slice(&(len as u32).to_le_bytes());
        }
        self.0.extend_from_slice(operand);
        self
    }

    pub fn add_script(mut self, other: &Script) -> Self {
        self.0.extend_from_slice(&other.0);
        self
    }

    /// Authorize `tx.vin[input_index]` by executing the unlocking script
    /// against the referenced locking script.
    ///
    /// A pay-to-script-hash locking script triggers a second phase: the
    /// unlocking script must be `(signature, serialized redeem script)`,
    /// and the redeem script is executed with the signature pushed back.
    pub fn validate(
        script_sig: &Script,
        script_pubkey: &Script,
        tx: &Transaction,
        input_index: usize,
    ) -> Result<()> {
        let cat = Script::new()
            .add_script(script_sig)
            .add_op_code(OP_CODESEPARATOR)
            .add_script(script_pubkey);
        cat.evaluate(tx, input_index)?;

        if !script_pubkey.is_pay_to_script_hash() {
            return Ok(());
        }

        let (_, sig, pc) = script_sig.parse_next_op(0)?;
        let sig = sig.to_vec();
        let (_, redeem_bytes, _) = script_sig.parse_next_op(pc)?;
        let redeem_script = Script::from_bytes(redeem_bytes.to_vec());

        let cat = Script::new()
            .add_operand(&sig)
            .add_op_code(OP_CODESEPARATOR)
            .add_script(&redeem_script);
        cat.evaluate(tx, input_index)
    }

    /// Run the script to completion; succeeds when the top stack value
    /// exists and is truthy.
    fn evaluate(&self, tx: &Transaction, input_index: usize) -> Result<()> {
        debug!(len = self.0.len(), script = %self.disasm(), "evaluating script");

        let mut stack = Stack::new();
        let mut script_pubkey_start = 0usize;
        let mut pc = 0usize;
        while pc < self.0.len() {
            let (op, operand, new_pc) = self.parse_next_op(pc)?;
            pc = new_pc;
            self.exec_op(op, operand, pc, &mut script_pubkey_start, &mut stack, tx, input_index)?;
        }

        stack.validate_top()
    }

    /// Decode the opcode at `pc` and its operand, returning the advanced
    /// program counter. Non-push opcodes carry an empty operand.
    fn parse_next_op(&self, pc: usize) -> Result<(u8, &[u8], usize)> {
        let script = &self.0;
        if pc >= script.len() {
            return Err(ScriptError::Bounds);
        }

        let op = script[pc];
        let mut pc = pc + 1;

        if op > OP_PUSHDATA4 {
            return Ok((op, &[], pc));
        }

        let operand_size;
        if op < OP_PUSHDATA1 {
            // The opcode itself encodes the operand size.
            operand_size = usize::from(op);
        } else if op == OP_PUSHDATA1 {
            if script.len() - pc < 1 {
                return Err(ScriptError::PushDataTooShort("OP_PUSHDATA1"));
            }
            operand_size = usize::from(script[pc]);
            pc += 1;
        } else if op == OP_PUSHDATA2 {
            if script.len() - pc < 2 {
                return Err(ScriptError::PushDataTooShort("OP_PUSHDATA2"));
            }
            operand_size = usize::from(u16::from_le_bytes([script[pc], script[pc + 1]]));
            pc += 2;
        } else {
            if script.len() - pc < 4 {
                return Err(ScriptError::PushDataTooShort("OP_PUSHDATA4"));
            }
            let len = u32::from_le_bytes([script[pc], script[pc + 1], script[pc + 2], script[pc + 3]]);
            operand_size = len as usize;
            pc += 4;
        }

        if script.len() - pc < operand_size {
            return Err(ScriptError::Bounds);
        }
        let operand = &script[pc..pc + operand_size];
        Ok((op, operand, pc + operand_size))
    }

    #[allow(clippy::too_many_arguments)]
    fn exec_op(
        &self,
        op: u8,
        operand: &[u8],
        pc: usize,
        script_pubkey_start: &mut usize,
        stack: &mut Stack,
        tx: &Transaction,
        input_index: usize,
    ) -> Result<()> {
        if is_push_op(op) {
            stack.push(operand.to_vec());
            return Ok(());
        }
        if is_small_int_op(op) {
            let n = if op == OP_1NEGATE { -1 } else { i64::from(op - OP_1) + 1 };
            stack.push(script_num_bytes(n));
            return Ok(());
        }

        match op {
            OP_DUP => {
                let top = stack.top_n(1).ok_or(ScriptError::InvalidStackOperation)?.clone();
                stack.push(top);
            }

            OP_ADD | OP_SUB => {
                if stack.size() < 2 {
                    return Err(ScriptError::InvalidStackOperation);
                }
                let rhs = script_num_from(stack.top_n(1).ok_or(ScriptError::InvalidStackOperation)?, MAX_NUM_OPERAND_LEN)?;
                let lhs = script_num_from(stack.top_n(2).ok_or(ScriptError::InvalidStackOperation)?, MAX_NUM_OPERAND_LEN)?;
                let result = if op == OP_ADD { lhs + rhs } else { lhs - rhs };
                stack.pop();
                stack.pop();
                stack.push(script_num_bytes(result));
            }

            OP_EQUAL | OP_EQUALVERIFY => {
                if stack.size() < 2 {
                    return Err(ScriptError::InvalidStackOperation);
                }
                let rhs = stack.pop().ok_or(ScriptError::InvalidStackOperation)?;
                let lhs = stack.pop().ok_or(ScriptError::InvalidStackOperation)?;
                let is_equal = lhs == rhs;
                stack.push(if is_equal { vec![1] } else { Vec::new() });
                if op == OP_EQUALVERIFY {
                    if is_equal {
                        stack.pop();
                    } else {
                        return Err(ScriptError::EqualVerify);
                    }
                }
            }

            OP_HASH160 => {
                let top = stack.pop().ok_or(ScriptError::InvalidStackOperation)?;
                stack.push(hash160(&top).to_vec());
            }

            OP_CODESEPARATOR => {
                // The signed locking script starts after the separator.
                *script_pubkey_start = pc;
            }

            OP_CHECKSIG | OP_CHECKSIGVERIFY => {
                if stack.size() < 2 {
                    return Err(ScriptError::InvalidStackOperation);
                }
                let pub_key = stack.pop().ok_or(ScriptError::InvalidStackOperation)?;
                let signature = stack.pop().ok_or(ScriptError::InvalidStackOperation)?;
                let script_pubkey = &self.0[*script_pubkey_start..];
                let is_verified = verify_sig(&signature, &pub_key, script_pubkey, tx, input_index);
                stack.push(if is_verified { vec![1] } else { Vec::new() });
                if op == OP_CHECKSIGVERIFY {
                    if is_verified {
                        stack.pop();
                    } else {
                        return Err(ScriptError::SignatureVerifyFail);
                    }
                }
            }

            _ => return Err(ScriptError::BadOpcode(op)),
        }
        Ok(())
    }

    /// Whether the script is the 23-byte pay-to-script-hash template
    /// `OP_HASH160 <20-byte hash> OP_EQUAL`.
    pub fn is_pay_to_script_hash(&self) -> bool {
        let s = &self.0;
        s.len() == P2SH_SCRIPT_LEN
            && s[0] == OP_HASH160
            && s[1] == PUB_KEY_HASH_LEN as u8
            && s[22] == OP_EQUAL
    }

    /// Whether the script is the 25-byte pay-to-pubkey-hash template.
    pub fn is_pay_to_pub_key_hash(&self) -> bool {
        self.0.len() == P2PKH_SCRIPT_LEN && self.has_p2pkh_prefix()
    }

    fn has_p2pkh_prefix(&self) -> bool {
        let s = &self.0;
        s.len() >= P2PKH_SCRIPT_LEN
            && s[0] == OP_DUP
            && s[1] == OP_HASH160
            && s[2] == PUB_KEY_HASH_LEN as u8
            && s[23] == OP_EQUALVERIFY
            && s[24] == OP_CHECKSIG
    }

    /// The leading pay-to-pubkey-hash template of a P2PKH or token script.
    /// Address queries match token outputs through this prefix.
    pub fn p2pkh_prefix(&self) -> Option<Script> {
        if self.has_p2pkh_prefix() {
            Some(Script(self.0[..P2PKH_SCRIPT_LEN].to_vec()))
        } else {
            None
        }
    }

    /// Whether the script issues a token: P2PKH prefix, separator, pushed
    /// name and pushed 8-byte supply.
    pub fn is_token_issue(&self) -> bool {
        match self.token_operands() {
            Some(ops) => ops.len() == 2 && ops[1].len() == 8,
            None => false,
        }
    }

    /// Whether the script transfers a token: P2PKH prefix, separator and a
    /// pushed 8-byte amount.
    pub fn is_token_transfer(&self) -> bool {
        match self.token_operands() {
            Some(ops) => ops.len() == 1 && ops[0].len() == 8,
            None => false,
        }
    }

    /// Token quantity carried by an issue or transfer script.
    pub fn token_amount(&self) -> Option<u64> {
        let ops = self.token_operands()?;
        let amount = match ops.len() {
            1 => ops[0],
            2 => ops[1],
            _ => return None,
        };
        let bytes: [u8; 8] = amount.try_into().ok()?;
        Some(u64::from_be_bytes(bytes))
    }

    /// The pushes following a P2PKH prefix and code separator, when the
    /// script has that shape.
    fn token_operands(&self) -> Option<Vec<&[u8]>> {
        if !self.has_p2pkh_prefix()
            || self.0.len() <= P2PKH_SCRIPT_LEN
            || self.0[P2PKH_SCRIPT_LEN] != OP_CODESEPARATOR
        {
            return None;
        }
        let mut pc = P2PKH_SCRIPT_LEN + 1;
        let mut operands = Vec::new();
        while pc < self.0.len() {
            let (op, operand, new_pc) = self.parse_next_op(pc).ok()?;
            if !is_push_op(op) {
                return None;
            }
            operands.push(operand);
            pc = new_pc;
        }
        Some(operands)
    }

    /// Pubkey hash bound by a P2PKH or token locking script.
    pub fn extract_address(&self) -> Option<Address> {
        if !self.has_p2pkh_prefix() {
            return None;
        }
        let mut hash = [0u8; PUB_KEY_HASH_LEN];
        hash.copy_from_slice(&self.0[3..3 + PUB_KEY_HASH_LEN]);
        Some(Address(hash))
    }

    /// Iterate over opcodes, skipping push payloads. Iteration ends early
    /// on a malformed push.
    pub fn iter_ops(&self) -> ScriptOps<'_> {
        ScriptOps { script: self, pc: 0 }
    }

    /// Human-readable disassembly. Stops at the first parse failure and
    /// appends the error.
    pub fn disasm(&self) -> String {
        let mut parts = Vec::new();
        let mut pc = 0usize;
        while pc < self.0.len() {
            match self.parse_next_op(pc) {
                Ok((op, operand, new_pc)) => {
                    if is_push_op(op) {
                        parts.push(hex::encode(operand));
                    } else {
                        parts.push(op_code_name(op).to_string());
                    }
                    pc = new_pc;
                }
                Err(err) => {
                    parts.push(format!("[error: {err}]"));
                    break;
                }
            }
        }
        parts.join(" ")
    }
}

/// Opcode iterator returned by [`Script::iter_ops`].
pub struct ScriptOps<'a> {
    script: &'a Script,
    pc: usize,
}

impl Iterator for ScriptOps<'_> {
    type Item = u8;

    fn next(&mut self) -> Option<u8> {
        if self.pc >= self.script.0.len() {
            return None;
        }
        match self.script.parse_next_op(self.pc) {
            Ok((op, _, new_pc)) => {
                self.pc = new_pc;
                Some(op)
            }
            Err(_) => {
                self.pc = self.script.0.len();
                None
            }
        }
    }
}

/// Evaluation stack.
struct Stack(SmallVec<[Operand; 8]>);

impl Stack {
    fn new() -> Self {
        Stack(SmallVec::new())
    }

    fn size(&self) -> usize {
        self.0.len()
    }

    fn push(&mut self, operand: Operand) {
        self.0.push(operand);
    }

    fn pop(&mut self) -> Option<Operand> {
        self.0.pop()
    }

    /// The n-th operand from the top; `top_n(1)` is the top itself.
    fn top_n(&self, n: usize) -> Option<&Operand> {
        if n == 0 || n > self.0.len() {
            return None;
        }
        self.0.get(self.0.len() - n)
    }

    fn validate_top(&self) -> Result<()> {
        match self.top_n(1) {
            None => Err(ScriptError::InvalidStackOperation),
            Some(top) if is_truthy(top) => Ok(()),
            Some(_) => Err(ScriptError::EvalFalse),
        }
    }
}

/// Script truthiness: non-empty with a non-zero payload. Negative zero
/// (a lone sign bit in the last byte) is false.
fn is_truthy(operand: &[u8]) -> bool {
    for (i, byte) in operand.iter().enumerate() {
        if *byte != 0 {
            return !(i == operand.len() - 1 && *byte == 0x80);
        }
    }
    false
}

/// Minimal little-endian sign-magnitude encoding of a script number.
pub fn script_num_bytes(n: i64) -> Vec<u8> {
    if n == 0 {
        return Vec::new();
    }
    let negative = n < 0;
    let mut abs = n.unsigned_abs();
    let mut out = Vec::with_capacity(9);
    while abs > 0 {
        out.push((abs & 0xff) as u8);
        abs >>= 8;
    }
    let high_bit_set = out.last().is_some_and(|b| b & 0x80 != 0);
    if high_bit_set {
        out.push(if negative { 0x80 } else { 0x00 });
    } else if negative {
        if let Some(last) = out.last_mut() {
            *last |= 0x80;
        }
    }
    out
}

/// Decode a script number, rejecting non-minimal encodings and operands
/// wider than `max_len` bytes.
pub fn script_num_from(bytes: &[u8], max_len: usize) -> Result<i64> {
    if bytes.len() > max_len {
        return Err(ScriptError::NumberOutOfRange);
    }
    if bytes.is_empty() {
        return Ok(0);
    }

    let last = bytes[bytes.len() - 1];
    if last & 0x7f == 0 {
        // A trailing 0x00/0x80 is only justified by a sign bit in the byte
        // below it.
        if bytes.len() == 1 || bytes[bytes.len() - 2] & 0x80 == 0 {
            return Err(ScriptError::NonMinimalNumber);
        }
    }

    let mut result: i64 = 0;
    for (i, byte) in bytes.iter().enumerate() {
        result |= i64::from(*byte) << (8 * i);
    }
    if last & 0x80 != 0 {
        result &= !(0x80i64 << (8 * (bytes.len() - 1)));
        result = -result;
    }
    Ok(result)
}

/// Signature-hash for `tx.vin[input_index]` over the signed portion of the
/// locking script.
///
/// Every other input's `script_sig` is blanked and the signed input's is
/// replaced by `script_pubkey`; the digest is recomputed fresh on a private
/// draft so concurrent evaluations never observe the substitution.
pub fn calc_sig_hash(
    script_pubkey: &[u8],
    tx: &Transaction,
    input_index: usize,
) -> Result<Hash> {
    if input_index >= tx.vin.len() {
        return Err(ScriptError::InputIndexOutOfBounds(input_index));
    }

    let mut draft = tx.clone();
    for (i, input) in draft.vin.iter_mut().enumerate() {
        input.script_sig = if i == input_index {
            script_pubkey.to_vec()
        } else {
            Vec::new()
        };
    }
    Ok(draft.hash())
}

/// Verify a DER signature over the sighash of the given locking-script
/// suffix. Malformed signatures and keys fail verification rather than
/// aborting the script.
fn verify_sig(
    sig_bytes: &[u8],
    pub_key_bytes: &[u8],
    script_pubkey: &[u8],
    tx: &Transaction,
    input_index: usize,
) -> bool {
    let signature = match Signature::from_der(sig_bytes) {
        Ok(sig) => sig,
        Err(_) => {
            debug!("failed to deserialize signature");
            return false;
        }
    };
    let pub_key = match PublicKey::from_slice(pub_key_bytes) {
        Ok(pk) => pk,
        Err(_) => {
            debug!("failed to deserialize public key");
            return false;
        }
    };
    let sig_hash = match calc_sig_hash(script_pubkey, tx, input_index) {
        Ok(hash) => hash,
        Err(_) => return false,
    };
    let message = match Message::from_digest_slice(&sig_hash) {
        Ok(msg) => msg,
        Err(_) => return false,
    };
    SECP256K1.with(|secp| secp.verify_ecdsa(&message, &signature, &pub_key).is_ok())
}
