//! Contract instruction set and code validation
//!
//! Contract code is a set of named functions, each a flat list of
//! operations over a value stack. Stateful operations (storage, calls,
//! coin sends) are carried out by the sandbox; the pure stack operations
//! are evaluated here.

use crate::constants::*;
use crate::error::{LedgerError, Result};
use crate::types::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Function names bound to host primitives. They can never be the target of a
/// call and may not be defined by published code.
pub const RESERVED_FUNCTIONS: [&str; 3] = ["send", "call", "flush"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Visibility {
    /// Callable by transactions and by other contracts
    Public,
    /// Callable only from within the same contract
    Local,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    Push(Value),
    /// Push argument n, or nil if it was not supplied
    Arg(u8),
    Dup,
    Drop,
    Swap,
    Add,
    Sub,
    Mul,
    Eq,
    Lt,
    Not,
    Concat,
    Jump(usize),
    JumpIfNot(usize),
    /// key -> value of this contract's persistent data (nil if absent)
    Load,
    /// key value -> ; storing nil deletes the key
    Store,
    Caller,
    SelfAddress,
    Payment,
    Balance,
    CallLocal { function: String, argc: u8 },
    /// contract function arg1..argN -> results
    Call { argc: u8 },
    /// destination amount ->
    Send,
    FlushDust,
    /// message -> (fails the invocation)
    Abort,
    Return(u8),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Function {
    pub visibility: Visibility,
    pub body: Vec<Op>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractCode {
    pub functions: BTreeMap<String, Function>,
}

impl ContractCode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn public(mut self, name: &str, body: Vec<Op>) -> Self {
        self.functions.insert(
            name.to_string(),
            Function { visibility: Visibility::Public, body },
        );
        self
    }

    pub fn local(mut self, name: &str, body: Vec<Op>) -> Self {
        self.functions.insert(
            name.to_string(),
            Function { visibility: Visibility::Local, body },
        );
        self
    }

    /// Serialized size, the unit the publish limit is expressed in
    pub fn code_size(&self) -> usize {
        serde_json::to_vec(self).map(|bytes| bytes.len()).unwrap_or(usize::MAX)
    }
}

/// ValidateCode: 𝒞𝒪𝒟𝐸 × ℕ → {valid, malformed}
///
/// 1. Serialized code must fit the publish limit
/// 2. No function may use a reserved primitive name
/// 3. Jump targets must stay inside the function body
/// 4. Local calls must name a defined function
/// 5. Argument references must address a supported slot
pub fn validate_code(code: &ContractCode, max_code_len: usize) -> Result<()> {
    // 1. Size
    let size = code.code_size();
    if size > max_code_len {
        return Err(LedgerError::MalformedTransaction(format!(
            "contract code {} bytes exceeds {}",
            size, max_code_len
        )));
    }

    if code.functions.is_empty() {
        return Err(LedgerError::MalformedTransaction("contract defines no functions".into()));
    }

    for (name, function) in &code.functions {
        // 2. Reserved names
        if RESERVED_FUNCTIONS.contains(&name.as_str()) {
            return Err(LedgerError::MalformedTransaction(format!(
                "function name '{}' is reserved",
                name
            )));
        }

        for op in &function.body {
            match op {
                // 3. Jump targets
                Op::Jump(target) | Op::JumpIfNot(target) if *target > function.body.len() => {
                    return Err(LedgerError::MalformedTransaction(format!(
                        "jump target {} outside '{}'",
                        target, name
                    )));
                }
                // 4. Local calls
                Op::CallLocal { function: callee, .. } if !code.functions.contains_key(callee) => {
                    return Err(LedgerError::MalformedTransaction(format!(
                        "'{}' calls undefined local function '{}'",
                        name, callee
                    )));
                }
                // 5. Argument slots
                Op::Arg(n) if *n as usize >= MAX_CALL_ARGS => {
                    return Err(LedgerError::MalformedTransaction(format!(
                        "argument slot {} in '{}'",
                        n, name
                    )));
                }
                _ => {}
            }
        }
    }

    Ok(())
}

// ============================================================================
// STACK OPERATIONS
// ============================================================================

fn underflow() -> LedgerError {
    LedgerError::ContractExecution("Stack underflow".to_string())
}

fn pop(stack: &mut Vec<Value>) -> Result<Value> {
    stack.pop().ok_or_else(underflow)
}

pub(crate) fn pop_int(stack: &mut Vec<Value>) -> Result<i64> {
    match pop(stack)? {
        Value::Int(i) => Ok(i),
        other => Err(LedgerError::ContractExecution(format!(
            "expected integer, found {:?}",
            other
        ))),
    }
}

fn concat_part(value: Value) -> Result<String> {
    match value {
        Value::Str(s) => Ok(s),
        Value::Int(i) => Ok(i.to_string()),
        other => Err(LedgerError::ContractExecution(format!(
            "cannot concatenate {:?}",
            other
        ))),
    }
}

fn overflow() -> LedgerError {
    LedgerError::ContractExecution("Integer overflow".to_string())
}

/// Execute an operation that only touches the value stack
///
/// Returns the number of bytes the operation copied or allocated, so the
/// caller can meter them. Strings never grow past `MAX_VALUE_LEN`.
pub(crate) fn execute_stack_op(op: &Op, stack: &mut Vec<Value>) -> Result<usize> {
    let mut copied = 0;
    match op {
        Op::Push(value) => {
            copied = value.byte_len();
            stack.push(value.clone());
        }

        Op::Dup => {
            let top = stack.last().cloned().ok_or_else(underflow)?;
            copied = top.byte_len();
            stack.push(top);
        }

        Op::Drop => {
            pop(stack)?;
        }

        Op::Swap => {
            let len = stack.len();
            if len < 2 {
                return Err(underflow());
            }
            stack.swap(len - 1, len - 2);
        }

        Op::Add | Op::Sub | Op::Mul => {
            let b = pop_int(stack)?;
            let a = pop_int(stack)?;
            let result = match op {
                Op::Add => a.checked_add(b),
                Op::Sub => a.checked_sub(b),
                _ => a.checked_mul(b),
            };
            stack.push(Value::Int(result.ok_or_else(overflow)?));
        }

        Op::Eq => {
            let b = pop(stack)?;
            let a = pop(stack)?;
            stack.push(Value::Bool(a == b));
        }

        Op::Lt => {
            let b = pop_int(stack)?;
            let a = pop_int(stack)?;
            stack.push(Value::Bool(a < b));
        }

        Op::Not => {
            let a = pop(stack)?;
            stack.push(Value::Bool(!a.is_truthy()));
        }

        Op::Concat => {
            let b = concat_part(pop(stack)?)?;
            let a = concat_part(pop(stack)?)?;
            copied = a.len() + b.len();
            if copied > MAX_VALUE_LEN {
                return Err(LedgerError::ContractExecution(format!(
                    "string of {} bytes exceeds {}",
                    copied, MAX_VALUE_LEN
                )));
            }
            stack.push(Value::Str(a + &b));
        }

        other => {
            return Err(LedgerError::ContractExecution(format!(
                "{:?} is not a stack operation",
                other
            )))
        }
    }

    if stack.len() > MAX_STACK_SIZE {
        return Err(LedgerError::ContractExecution("Stack overflow".to_string()));
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(ops: &[Op]) -> Result<Vec<Value>> {
        let mut stack = Vec::new();
        for op in ops {
            execute_stack_op(op, &mut stack)?;
        }
        Ok(stack)
    }

    #[test]
    fn test_arithmetic() {
        let stack = run(&[Op::Push(Value::Int(7)), Op::Push(Value::Int(5)), Op::Sub]).unwrap();
        assert_eq!(stack, vec![Value::Int(2)]);

        let stack = run(&[Op::Push(Value::Int(6)), Op::Push(Value::Int(7)), Op::Mul]).unwrap();
        assert_eq!(stack, vec![Value::Int(42)]);
    }

    #[test]
    fn test_overflow_is_an_error() {
        let result = run(&[Op::Push(i64::MAX.into()), Op::Push(Value::Int(1)), Op::Add]);
        assert!(matches!(result, Err(LedgerError::ContractExecution(_))));
    }

    #[test]
    fn test_concat_and_compare() {
        let stack = run(&[Op::Push("key".into()), Op::Push(Value::Int(3)), Op::Concat]).unwrap();
        assert_eq!(stack, vec![Value::Str("key3".into())]);

        let stack = run(&[Op::Push(Value::Int(1)), Op::Push(Value::Int(2)), Op::Lt, Op::Not]).unwrap();
        assert_eq!(stack, vec![Value::Bool(false)]);
    }

    #[test]
    fn test_underflow() {
        assert!(run(&[Op::Drop]).is_err());
        assert!(run(&[Op::Push(Value::Int(1)), Op::Swap]).is_err());
        assert!(run(&[Op::Push(Value::Int(1)), Op::Add]).is_err());
    }

    #[test]
    fn test_stack_limit() {
        let ops: Vec<Op> = (0..=MAX_STACK_SIZE).map(|_| Op::Push(Value::Nil)).collect();
        assert!(run(&ops[..MAX_STACK_SIZE]).is_ok());
        assert!(run(&ops).is_err());
    }

    #[test]
    fn test_string_growth_is_capped() {
        // Doubling an 8 byte string: the 11th doubling reaches MAX_VALUE_LEN
        let mut ops = vec![Op::Push("xxxxxxxx".into())];
        for _ in 0..11 {
            ops.extend([Op::Dup, Op::Concat]);
        }
        let stack = run(&ops).unwrap();
        assert_eq!(stack[0].byte_len(), MAX_VALUE_LEN);

        ops.extend([Op::Dup, Op::Concat]);
        assert!(matches!(run(&ops), Err(LedgerError::ContractExecution(_))));
    }

    #[test]
    fn test_copies_are_reported() {
        let mut stack = vec![Value::Str("y".repeat(300))];
        assert_eq!(execute_stack_op(&Op::Dup, &mut stack).unwrap(), 300);
        assert_eq!(execute_stack_op(&Op::Concat, &mut stack).unwrap(), 600);
        assert_eq!(execute_stack_op(&Op::Push(Value::Int(1)), &mut stack).unwrap(), 0);
    }

    #[test]
    fn test_validate_rejects_reserved_name() {
        let code = ContractCode::new().public("send", vec![]);
        assert!(matches!(
            validate_code(&code, MAX_CONTRACT_CODE_LEN),
            Err(LedgerError::MalformedTransaction(_))
        ));
    }

    #[test]
    fn test_validate_rejects_bad_jump_and_missing_local() {
        let code = ContractCode::new().public("f", vec![Op::Jump(5)]);
        assert!(validate_code(&code, MAX_CONTRACT_CODE_LEN).is_err());

        let code = ContractCode::new().public(
            "f",
            vec![Op::CallLocal { function: "g".into(), argc: 0 }],
        );
        assert!(validate_code(&code, MAX_CONTRACT_CODE_LEN).is_err());

        let code = ContractCode::new()
            .public("f", vec![Op::CallLocal { function: "g".into(), argc: 0 }, Op::Jump(2)])
            .local("g", vec![]);
        assert!(validate_code(&code, MAX_CONTRACT_CODE_LEN).is_ok());
    }

    #[test]
    fn test_validate_rejects_oversized_code() {
        let body = vec![Op::Push(Value::Str("x".repeat(200))); 10];
        let code = ContractCode::new().public("big", body);
        assert!(validate_code(&code, 1000).is_err());
        assert!(validate_code(&code, MAX_CONTRACT_CODE_LEN).is_ok());
    }
}
