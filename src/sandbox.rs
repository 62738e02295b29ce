//! Metered, deterministic contract execution against a state snapshot
//!
//! An invocation runs on an explicit stack of frames. Each frame keeps its own
//! view of every contract's persistent data it has written; reads look down the
//! stack and fall back to the snapshot. When a frame returns, its views replace
//! the caller's (a dump replaces, it does not merge), so the value left by the
//! most recently completed write is the one that persists. Any failure anywhere
//! in the stack discards every frame: nothing of a failed invocation survives.

use crate::address::{parse_contract, parse_send_destination};
use crate::config::ChainConfig;
use crate::constants::*;
use crate::error::{LedgerError, Result};
use crate::types::*;
use crate::vm::{execute_stack_op, ContractCode, Function, Op, Visibility};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Read access to contract accounts and balances at some point in time
pub trait StateView {
    fn account(&self, id: &ContractId) -> Option<&ContractAccount>;

    /// Persistent data as this view sees it
    fn data(&self, id: &ContractId) -> Option<&DataMap> {
        self.account(id).map(|account| &account.data)
    }

    /// Confirmed value the contract may send: mature outputs plus dust
    fn spendable_balance(&self, id: &ContractId) -> Amount;
}

/// Host primitives that share the function namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Send,
    Call,
    Flush,
}

impl Builtin {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "send" => Some(Builtin::Send),
            "call" => Some(Builtin::Call),
            "flush" => Some(Builtin::Flush),
            _ => None,
        }
    }
}

/// What a function name resolves to in a contract
#[derive(Debug, Clone, Copy)]
pub enum CallTarget<'c> {
    Public(&'c Function),
    Internal(Builtin),
}

/// Resolve an externally callable name. Local functions are invisible from
/// outside, so they resolve the same way as missing ones.
pub fn resolve_call_target<'c>(code: &'c ContractCode, name: &str) -> Result<CallTarget<'c>> {
    if let Some(builtin) = Builtin::from_name(name) {
        return Ok(CallTarget::Internal(builtin));
    }
    match code.functions.get(name) {
        Some(function) if function.visibility == Visibility::Public => Ok(CallTarget::Public(function)),
        _ => Err(LedgerError::FunctionNotFound(name.to_string())),
    }
}

fn entry_function<'c>(code: &'c ContractCode, name: &str) -> Result<&'c Function> {
    match resolve_call_target(code, name)? {
        CallTarget::Public(function) => Ok(function),
        CallTarget::Internal(_) => Err(LedgerError::ForbiddenDirectCall(name.to_string())),
    }
}

/// One top-level contract invocation
#[derive(Debug, Clone)]
pub struct Invocation<'a> {
    pub contract: ContractId,
    pub function: &'a str,
    pub args: &'a [Value],
    /// Value attached by the calling transaction
    pub payment: Amount,
    /// None for read-only queries
    pub caller: Option<PubKeyHash>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    pub from: ContractId,
    pub to: PubKeyHash,
    pub amount: Amount,
}

/// Coin movements requested by an invocation, in request order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferPlan {
    pub transfers: Vec<Transfer>,
    /// Contracts that asked for their dust to be flushed
    pub flush: BTreeSet<ContractId>,
}

impl TransferPlan {
    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty() && self.flush.is_empty()
    }

    /// Total sent per paying contract
    pub fn outgoing(&self) -> BTreeMap<ContractId, Amount> {
        let mut totals = BTreeMap::new();
        for transfer in &self.transfers {
            *totals.entry(transfer.from).or_insert(0) += transfer.amount;
        }
        totals
    }
}

/// Persistent data written by an invocation: full replacement maps per contract
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateDelta {
    pub dumps: BTreeMap<ContractId, DataMap>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutcome {
    pub return_values: Vec<Value>,
    pub delta: StateDelta,
    pub transfers: TransferPlan,
    pub instructions_used: u64,
}

struct Frame {
    contract: ContractId,
    code: Arc<ContractCode>,
    function: String,
    pc: usize,
    stack: Vec<Value>,
    args: Vec<Value>,
    caller: Value,
    payment: Amount,
    depth: usize,
    views: BTreeMap<ContractId, DataMap>,
    transfers: Vec<Transfer>,
    flush: BTreeSet<ContractId>,
}

struct Machine<'s, S: StateView + ?Sized> {
    state: &'s S,
    config: &'s ChainConfig,
    frames: Vec<Frame>,
    used: u64,
}

/// Execute: 𝒮𝒯 × ℐ𝒩𝒱 → 𝒪𝒰𝒯 ∪ {error}
///
/// 1. Reject more arguments than the fixed slots
/// 2. Look up the contract and resolve the entry function
/// 3. Run frames until the entry frame returns, charging one instruction per op
///    plus one per `COPY_BYTES_PER_INSTRUCTION` bytes copied
/// 4. Check the size of every written data map
/// 5. Return the delta, transfer plan and return values
pub fn execute<S: StateView + ?Sized>(
    state: &S,
    invocation: &Invocation<'_>,
    config: &ChainConfig,
) -> Result<ExecutionOutcome> {
    // 1. Argument count
    check_arg_count(invocation.args.len(), config)?;

    // 2. Entry point
    let account = state
        .account(&invocation.contract)
        .ok_or_else(|| LedgerError::ContractNotFound(invocation.contract.to_string()))?;
    entry_function(&account.code, invocation.function)?;

    let caller = match invocation.caller {
        Some(pkh) => Value::Str(pkh.to_string()),
        None => Value::Nil,
    };
    let mut machine = Machine {
        state,
        config,
        frames: Vec::new(),
        used: 0,
    };
    machine.frames.push(Frame::new(
        invocation.contract,
        Arc::clone(&account.code),
        invocation.function.to_string(),
        invocation.args.to_vec(),
        caller,
        invocation.payment,
        0,
    ));

    // 3. Run
    let (views, transfers, flush, return_values) = machine.run()?;

    // 4. Data size
    for map in views.values() {
        let size = serde_json::to_vec(map)?.len();
        if size > config.max_contract_data_len {
            return Err(LedgerError::DataLimitExceeded {
                size,
                limit: config.max_contract_data_len,
            });
        }
    }

    // 5. Outcome
    Ok(ExecutionOutcome {
        return_values,
        delta: StateDelta { dumps: views },
        transfers: TransferPlan { transfers, flush },
        instructions_used: machine.used,
    })
}

fn check_arg_count(given: usize, config: &ChainConfig) -> Result<()> {
    if given > config.max_call_args {
        return Err(LedgerError::ArgumentLimitExceeded {
            given,
            limit: config.max_call_args,
        });
    }
    Ok(())
}

impl Frame {
    fn new(
        contract: ContractId,
        code: Arc<ContractCode>,
        function: String,
        args: Vec<Value>,
        caller: Value,
        payment: Amount,
        depth: usize,
    ) -> Self {
        Frame {
            contract,
            code,
            function,
            pc: 0,
            stack: Vec::new(),
            args,
            caller,
            payment,
            depth,
            views: BTreeMap::new(),
            transfers: Vec::new(),
            flush: BTreeSet::new(),
        }
    }
}

type FrameResult = (
    BTreeMap<ContractId, DataMap>,
    Vec<Transfer>,
    BTreeSet<ContractId>,
    Vec<Value>,
);

impl<'s, S: StateView + ?Sized> Machine<'s, S> {
    fn run(&mut self) -> Result<FrameResult> {
        loop {
            let frame = self.top()?;
            let code = Arc::clone(&frame.code);
            let body = &code
                .functions
                .get(&frame.function)
                .ok_or_else(|| LedgerError::FunctionNotFound(frame.function.clone()))?
                .body;

            // Falling off the end returns nothing
            let op = match body.get(frame.pc) {
                Some(op) => op,
                None => {
                    if let Some(done) = self.finish_frame(Vec::new())? {
                        return Ok(done);
                    }
                    continue;
                }
            };

            self.charge(1)?;
            self.top_mut()?.pc += 1;

            if let Some(done) = self.step(op)? {
                return Ok(done);
            }
        }
    }

    fn charge(&mut self, units: u64) -> Result<()> {
        self.used = self.used.saturating_add(units);
        if self.used > self.config.instruction_budget {
            return Err(LedgerError::InstructionBudgetExceeded(self.config.instruction_budget));
        }
        Ok(())
    }

    fn charge_copy(&mut self, bytes: usize) -> Result<()> {
        self.charge(bytes as u64 / COPY_BYTES_PER_INSTRUCTION)
    }

    fn top(&self) -> Result<&Frame> {
        self.frames
            .last()
            .ok_or_else(|| LedgerError::ContractExecution("empty call stack".into()))
    }

    fn top_mut(&mut self) -> Result<&mut Frame> {
        self.frames
            .last_mut()
            .ok_or_else(|| LedgerError::ContractExecution("empty call stack".into()))
    }

    /// Execute one op; returns the final result once the entry frame returns
    fn step(&mut self, op: &Op) -> Result<Option<FrameResult>> {
        match op {
            Op::Arg(n) => {
                let frame = self.top_mut()?;
                let value = frame.args.get(*n as usize).cloned().unwrap_or(Value::Nil);
                self.charge_copy(value.byte_len())?;
                self.push(value)?;
            }

            Op::Jump(target) => self.top_mut()?.pc = *target,

            Op::JumpIfNot(target) => {
                let frame = self.top_mut()?;
                let cond = frame
                    .stack
                    .pop()
                    .ok_or_else(|| LedgerError::ContractExecution("Stack underflow".into()))?;
                if !cond.is_truthy() {
                    frame.pc = *target;
                }
            }

            Op::Load => {
                let key = self.pop_str()?;
                let contract = self.top()?.contract;
                let value = self
                    .visible_data(&contract)
                    .and_then(|data| data.get(&key).cloned())
                    .unwrap_or(Value::Nil);
                self.charge_copy(value.byte_len())?;
                self.push(value)?;
            }

            Op::Store => {
                let value = self.pop()?;
                let key = self.pop_str()?;
                let contract = self.top()?.contract;
                let view = self.writable_view(contract)?;
                if value == Value::Nil {
                    view.remove(&key);
                } else {
                    view.insert(key, value);
                }
            }

            Op::Caller => {
                let caller = self.top()?.caller.clone();
                self.push(caller)?;
            }

            Op::SelfAddress => {
                let contract = self.top()?.contract;
                self.push(Value::Str(contract.to_string()))?;
            }

            Op::Payment => {
                let payment = self.top()?.payment;
                self.push(Value::Int(payment))?;
            }

            Op::Balance => {
                let contract = self.top()?.contract;
                let available = self.available(&contract);
                self.push(Value::Int(available))?;
            }

            Op::CallLocal { function, argc } => {
                let args = self.pop_args(*argc as usize)?;
                let parent = self.top()?;
                if !parent.code.functions.contains_key(function) {
                    return Err(LedgerError::FunctionNotFound(function.clone()));
                }
                let frame = Frame::new(
                    parent.contract,
                    Arc::clone(&parent.code),
                    function.clone(),
                    args,
                    parent.caller.clone(),
                    parent.payment,
                    parent.depth,
                );
                self.frames.push(frame);
            }

            Op::Call { argc } => {
                check_arg_count(*argc as usize, self.config)?;
                let args = self.pop_args(*argc as usize)?;
                let function = self.pop_str()?;
                let target = self.pop_str()?;
                self.call_contract(&target, function, args)?;
            }

            Op::Send => {
                let amount = self.pop()?;
                let destination = self.pop()?;
                self.send(destination, amount)?;
            }

            Op::FlushDust => {
                let frame = self.top_mut()?;
                let contract = frame.contract;
                frame.flush.insert(contract);
            }

            Op::Abort => {
                let message = self.pop()?;
                return Err(LedgerError::ContractExecution(match message {
                    Value::Str(s) => s,
                    other => format!("{:?}", other),
                }));
            }

            Op::Return(n) => {
                let frame = self.top_mut()?;
                let n = *n as usize;
                if frame.stack.len() < n {
                    return Err(LedgerError::ContractExecution("Stack underflow".into()));
                }
                let values = frame.stack.split_off(frame.stack.len() - n);
                return self.finish_frame(values);
            }

            other => {
                let copied = execute_stack_op(other, &mut self.top_mut()?.stack)?;
                self.charge_copy(copied)?;
            }
        }
        Ok(None)
    }

    /// Contract-to-contract call
    ///
    /// 1. The target must be a published contract
    /// 2. The name must resolve to a public function; primitives are refused
    /// 3. The new frame may not exceed the depth limit
    fn call_contract(&mut self, target: &str, function: String, args: Vec<Value>) -> Result<()> {
        // 1. Contract
        let id = parse_contract(target)?;
        let account = self
            .state
            .account(&id)
            .ok_or_else(|| LedgerError::ContractNotFound(target.to_string()))?;

        // 2. Function
        entry_function(&account.code, &function)?;

        // 3. Depth
        let parent = self.top()?;
        let depth = parent.depth + 1;
        if depth > self.config.max_call_depth {
            return Err(LedgerError::RecursionLimitExceeded(self.config.max_call_depth));
        }

        let caller = Value::Str(parent.contract.to_string());
        let frame = Frame::new(id, Arc::clone(&account.code), function, args, caller, 0, depth);
        self.frames.push(frame);
        Ok(())
    }

    /// Coin send from the running contract to an ordinary address
    ///
    /// 1. The destination must be an address, never a contract
    /// 2. The amount must be a positive, representable number of units
    /// 3. It may not exceed what the contract has left in this invocation
    fn send(&mut self, destination: Value, amount: Value) -> Result<()> {
        // 1. Destination
        let to = match &destination {
            Value::Str(text) => parse_send_destination(text)?,
            other => return Err(LedgerError::InvalidDestination(format!("{:?}", other))),
        };

        // 2. Amount
        let amount = match &amount {
            Value::Int(units) => *units,
            Value::Str(text) => parse_coin_amount(text)
                .ok_or_else(|| LedgerError::AmountOutOfRange(text.clone()))?,
            other => return Err(LedgerError::AmountOutOfRange(format!("{:?}", other))),
        };
        if amount <= 0 || amount > MAX_MONEY {
            return Err(LedgerError::AmountOutOfRange(format!(
                "SendCoins => amount({}) out of range",
                amount
            )));
        }

        // 3. Funds
        let from = self.top()?.contract;
        if amount > self.available(&from) {
            return Err(LedgerError::InsufficientFunds("not enough amount".into()));
        }

        self.top_mut()?.transfers.push(Transfer { from, to, amount });
        Ok(())
    }

    /// Spendable balance minus what this invocation has already sent
    fn available(&self, contract: &ContractId) -> Amount {
        let sent: Amount = self
            .frames
            .iter()
            .flat_map(|frame| frame.transfers.iter())
            .filter(|transfer| transfer.from == *contract)
            .map(|transfer| transfer.amount)
            .sum();
        self.state.spendable_balance(contract) - sent
    }

    fn visible_data(&self, contract: &ContractId) -> Option<&DataMap> {
        self.frames
            .iter()
            .rev()
            .find_map(|frame| frame.views.get(contract))
            .or_else(|| self.state.data(contract))
    }

    /// The top frame's view of a contract, seeded from what is visible below it
    fn writable_view(&mut self, contract: ContractId) -> Result<&mut DataMap> {
        let has_view = self.top()?.views.contains_key(&contract);
        if !has_view {
            let seed = self.visible_data(&contract).cloned().unwrap_or_default();
            self.charge_copy(data_len(&seed))?;
            self.top_mut()?.views.insert(contract, seed);
        }
        self.top_mut()?
            .views
            .get_mut(&contract)
            .ok_or_else(|| LedgerError::ContractExecution("missing data view".into()))
    }

    /// Pop the top frame and hand its effects to the caller. Returns the final
    /// result when the entry frame finishes.
    fn finish_frame(&mut self, values: Vec<Value>) -> Result<Option<FrameResult>> {
        let child = self
            .frames
            .pop()
            .ok_or_else(|| LedgerError::ContractExecution("empty call stack".into()))?;
        match self.frames.last_mut() {
            None => Ok(Some((child.views, child.transfers, child.flush, values))),
            Some(parent) => {
                for (contract, map) in child.views {
                    parent.views.insert(contract, map);
                }
                parent.transfers.extend(child.transfers);
                parent.flush.extend(child.flush);
                parent.stack.extend(values);
                if parent.stack.len() > MAX_STACK_SIZE {
                    return Err(LedgerError::ContractExecution("Stack overflow".into()));
                }
                Ok(None)
            }
        }
    }

    fn push(&mut self, value: Value) -> Result<()> {
        let frame = self.top_mut()?;
        frame.stack.push(value);
        if frame.stack.len() > MAX_STACK_SIZE {
            return Err(LedgerError::ContractExecution("Stack overflow".into()));
        }
        Ok(())
    }

    fn pop(&mut self) -> Result<Value> {
        self.top_mut()?
            .stack
            .pop()
            .ok_or_else(|| LedgerError::ContractExecution("Stack underflow".into()))
    }

    fn pop_str(&mut self) -> Result<String> {
        match self.pop()? {
            Value::Str(s) => Ok(s),
            other => Err(LedgerError::ContractExecution(format!(
                "expected string, found {:?}",
                other
            ))),
        }
    }

    fn pop_args(&mut self, argc: usize) -> Result<Vec<Value>> {
        let frame = self.top_mut()?;
        if frame.stack.len() < argc {
            return Err(LedgerError::ContractExecution("Stack underflow".into()));
        }
        Ok(frame.stack.split_off(frame.stack.len() - argc))
    }
}

fn data_len(data: &DataMap) -> usize {
    data.iter().map(|(key, value)| key.len() + value.byte_len()).sum()
}

/// Parse a decimal coin amount into units, truncating digits past the last
/// representable decimal place.
pub fn parse_coin_amount(text: &str) -> Option<Amount> {
    let text = text.trim();
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let (whole, fraction) = match digits.split_once('.') {
        Some((w, f)) => (w, f),
        None => (digits, ""),
    };
    if whole.is_empty() && fraction.is_empty() {
        return None;
    }
    if !whole.chars().all(|c| c.is_ascii_digit()) || !fraction.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }

    let whole_units = if whole.is_empty() {
        0
    } else {
        whole.parse::<i64>().ok()?.checked_mul(COIN)?
    };
    let kept: String = fraction.chars().take(COIN_DECIMALS).collect();
    let fraction_units = if kept.is_empty() {
        0
    } else {
        let scale = 10i64.pow((COIN_DECIMALS - kept.len()) as u32);
        kept.parse::<i64>().ok()? * scale
    };

    let units = whole_units.checked_add(fraction_units)?;
    Some(if negative { -units } else { units })
}
