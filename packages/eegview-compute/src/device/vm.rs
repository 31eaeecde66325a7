//! Bytecode executed by compiled montage kernels.

use super::{Precision, Sample};
use crate::error::{ComputeError, DeviceStatus, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum Builtin {
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Atan2,
    Sinh,
    Cosh,
    Tanh,
    Exp,
    Log,
    Log10,
    Log2,
    Sqrt,
    Fabs,
    Pow,
    Fmin,
    Fmax,
    Fmod,
    Floor,
    Ceil,
    Round,
    Hypot,
    Sign,
    Clamp,
}

impl Builtin {
    pub(crate) fn lookup(name: &str) -> Option<Self> {
        let builtin = match name {
            "sin" => Builtin::Sin,
            "cos" => Builtin::Cos,
            "tan" => Builtin::Tan,
            "asin" => Builtin::Asin,
            "acos" => Builtin::Acos,
            "atan" => Builtin::Atan,
            "atan2" => Builtin::Atan2,
            "sinh" => Builtin::Sinh,
            "cosh" => Builtin::Cosh,
            "tanh" => Builtin::Tanh,
            "exp" => Builtin::Exp,
            "log" => Builtin::Log,
            "log10" => Builtin::Log10,
            "log2" => Builtin::Log2,
            "sqrt" => Builtin::Sqrt,
            "fabs" | "abs" => Builtin::Fabs,
            "pow" => Builtin::Pow,
            "fmin" | "min" => Builtin::Fmin,
            "fmax" | "max" => Builtin::Fmax,
            "fmod" => Builtin::Fmod,
            "floor" => Builtin::Floor,
            "ceil" => Builtin::Ceil,
            "round" => Builtin::Round,
            "hypot" => Builtin::Hypot,
            "sign" => Builtin::Sign,
            "clamp" => Builtin::Clamp,
            _ => return None,
        };
        Some(builtin)
    }

    pub(crate) fn arity(self) -> usize {
        match self {
            Builtin::Atan2
            | Builtin::Pow
            | Builtin::Fmin
            | Builtin::Fmax
            | Builtin::Fmod
            | Builtin::Hypot => 2,
            Builtin::Clamp => 3,
            _ => 1,
        }
    }

    fn apply(self, args: &[f64]) -> f64 {
        match self {
            Builtin::Sin => args[0].sin(),
            Builtin::Cos => args[0].cos(),
            Builtin::Tan => args[0].tan(),
            Builtin::Asin => args[0].asin(),
            Builtin::Acos => args[0].acos(),
            Builtin::Atan => args[0].atan(),
            Builtin::Atan2 => args[0].atan2(args[1]),
            Builtin::Sinh => args[0].sinh(),
            Builtin::Cosh => args[0].cosh(),
            Builtin::Tanh => args[0].tanh(),
            Builtin::Exp => args[0].exp(),
            Builtin::Log => args[0].ln(),
            Builtin::Log10 => args[0].log10(),
            Builtin::Log2 => args[0].log2(),
            Builtin::Sqrt => args[0].sqrt(),
            Builtin::Fabs => args[0].abs(),
            Builtin::Pow => args[0].powf(args[1]),
            Builtin::Fmin => args[0].min(args[1]),
            Builtin::Fmax => args[0].max(args[1]),
            Builtin::Fmod => args[0] % args[1],
            Builtin::Floor => args[0].floor(),
            Builtin::Ceil => args[0].ceil(),
            Builtin::Round => args[0].round(),
            Builtin::Hypot => args[0].hypot(args[1]),
            Builtin::Sign => {
                if args[0] > 0.0 {
                    1.0
                } else if args[0] < 0.0 {
                    -1.0
                } else {
                    0.0
                }
            }
            Builtin::Clamp => args[0].max(args[1]).min(args[2]),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum Accessor {
    In,
    X,
    Y,
    Z,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) enum Op {
    Const(f64),
    Index,
    LoadLocal(u16),
    StoreLocal(u16),
    LoadOut,
    StoreOut,
    Access(Accessor),
    Neg,
    Not,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
    Select,
    Builtin(Builtin),
    Call(u16),
    Return,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Function {
    pub name: String,
    pub params: u16,
    pub locals: u16,
    pub code: Vec<Op>,
}

/// A compiled kernel: helper functions plus the montage body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Module {
    pub precision: Precision,
    pub functions: Vec<Function>,
    pub body: Function,
}

/// Everything one work item of a montage dispatch can observe.
pub(crate) struct WorkItem<'a, T> {
    pub input: &'a [T],
    pub row_length: usize,
    pub row_offset: usize,
    pub channels: usize,
    pub positions: &'a [[f64; 3]],
    pub index: i64,
    pub sample: usize,
}

impl<T: Sample> WorkItem<'_, T> {
    pub(crate) fn input_sample(&self, channel: i64) -> f64 {
        if channel < 0 || channel as usize >= self.channels {
            return 0.0;
        }
        let position = channel as usize * self.row_length + self.row_offset + self.sample;
        self.input.get(position).map(|v| v.as_f64()).unwrap_or(0.0)
    }

    fn coordinate(&self, channel: i64, axis: usize) -> f64 {
        if channel < 0 {
            return 0.0;
        }
        self.positions
            .get(channel as usize)
            .map(|p| p[axis])
            .unwrap_or(0.0)
    }
}

fn truth(value: bool) -> f64 {
    if value {
        1.0
    } else {
        0.0
    }
}

fn corrupt(what: &str) -> ComputeError {
    ComputeError::device(
        DeviceStatus::ExecutionFailure,
        format!("execute kernel bytecode: {}", what),
    )
}

/// Evaluates modules with a reusable operand stack.
#[derive(Default)]
pub(crate) struct Machine {
    stack: Vec<f64>,
}

impl Machine {
    /// Run the montage body for one work item and return the value of `out`.
    pub(crate) fn run<T: Sample>(&mut self, module: &Module, item: &WorkItem<'_, T>) -> Result<f64> {
        self.stack.clear();
        let mut out = 0.0;
        self.execute(module, &module.body, Vec::new(), &mut out, item, 0)?;
        Ok(out)
    }

    fn pop(&mut self) -> Result<f64> {
        self.stack.pop().ok_or_else(|| corrupt("stack underflow"))
    }

    fn execute<T: Sample>(
        &mut self,
        module: &Module,
        function: &Function,
        mut locals: Vec<f64>,
        out: &mut f64,
        item: &WorkItem<'_, T>,
        depth: usize,
    ) -> Result<f64> {
        if depth > module.functions.len() + 1 {
            return Err(corrupt("call depth exceeded"));
        }
        locals.resize((function.locals as usize).max(locals.len()), 0.0);

        for op in &function.code {
            match op {
                Op::Const(value) => self.stack.push(*value),
                Op::Index => self.stack.push(item.index as f64),
                Op::LoadLocal(slot) => {
                    let value = *locals
                        .get(*slot as usize)
                        .ok_or_else(|| corrupt("local out of range"))?;
                    self.stack.push(value);
                }
                Op::StoreLocal(slot) => {
                    let value = self.pop()?;
                    let target = locals
                        .get_mut(*slot as usize)
                        .ok_or_else(|| corrupt("local out of range"))?;
                    *target = value;
                }
                Op::LoadOut => self.stack.push(*out),
                Op::StoreOut => *out = self.pop()?,
                Op::Access(accessor) => {
                    let channel = self.pop()?.trunc() as i64;
                    let value = match accessor {
                        Accessor::In => item.input_sample(channel),
                        Accessor::X => item.coordinate(channel, 0),
                        Accessor::Y => item.coordinate(channel, 1),
                        Accessor::Z => item.coordinate(channel, 2),
                    };
                    self.stack.push(value);
                }
                Op::Neg => {
                    let value = self.pop()?;
                    self.stack.push(-value);
                }
                Op::Not => {
                    let value = self.pop()?;
                    self.stack.push(truth(value == 0.0));
                }
                Op::Select => {
                    let otherwise = self.pop()?;
                    let then = self.pop()?;
                    let condition = self.pop()?;
                    self.stack.push(if condition != 0.0 { then } else { otherwise });
                }
                Op::Builtin(builtin) => {
                    let arity = builtin.arity();
                    if self.stack.len() < arity {
                        return Err(corrupt("stack underflow"));
                    }
                    let args = self.stack.split_off(self.stack.len() - arity);
                    self.stack.push(builtin.apply(&args));
                }
                Op::Call(index) => {
                    let callee = module
                        .functions
                        .get(*index as usize)
                        .ok_or_else(|| corrupt("call target out of range"))?;
                    let params = callee.params as usize;
                    if self.stack.len() < params {
                        return Err(corrupt("stack underflow"));
                    }
                    let args = self.stack.split_off(self.stack.len() - params);
                    let result = self.execute(module, callee, args, out, item, depth + 1)?;
                    self.stack.push(result);
                }
                Op::Return => return self.pop(),
                binary => {
                    let rhs = self.pop()?;
                    let lhs = self.pop()?;
                    let value = match binary {
                        Op::Add => lhs + rhs,
                        Op::Sub => lhs - rhs,
                        Op::Mul => lhs * rhs,
                        Op::Div => lhs / rhs,
                        Op::Rem => lhs % rhs,
                        Op::Lt => truth(lhs < rhs),
                        Op::Le => truth(lhs <= rhs),
                        Op::Gt => truth(lhs > rhs),
                        Op::Ge => truth(lhs >= rhs),
                        Op::Eq => truth(lhs == rhs),
                        Op::Ne => truth(lhs != rhs),
                        Op::And => truth(lhs != 0.0 && rhs != 0.0),
                        Op::Or => truth(lhs != 0.0 || rhs != 0.0),
                        _ => return Err(corrupt("unknown instruction")),
                    };
                    self.stack.push(value);
                }
            }
        }

        Ok(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item<'a>(input: &'a [f32], positions: &'a [[f64; 3]]) -> WorkItem<'a, f32> {
        WorkItem {
            input,
            row_length: 4,
            row_offset: 1,
            channels: 2,
            positions,
            index: 1,
            sample: 2,
        }
    }

    #[test]
    fn test_accessors_return_zero_out_of_range() {
        let input = [0.0, 1.0, 2.0, 3.0, 10.0, 11.0, 12.0, 13.0];
        let positions = [[1.0, 2.0, 3.0]];
        let item = item(&input, &positions);
        assert_eq!(item.input_sample(0), 3.0);
        assert_eq!(item.input_sample(1), 13.0);
        assert_eq!(item.input_sample(2), 0.0);
        assert_eq!(item.input_sample(-1), 0.0);
        assert_eq!(item.coordinate(0, 2), 3.0);
        assert_eq!(item.coordinate(1, 0), 0.0);
    }

    #[test]
    fn test_machine_evaluates_body_and_calls() {
        // twice(a) = a * 2; out = twice(in(INDEX)) + 1
        let twice = Function {
            name: "twice".to_string(),
            params: 1,
            locals: 1,
            code: vec![Op::LoadLocal(0), Op::Const(2.0), Op::Mul, Op::Return],
        };
        let body = Function {
            name: "montage".to_string(),
            params: 0,
            locals: 0,
            code: vec![
                Op::Index,
                Op::Access(Accessor::In),
                Op::Call(0),
                Op::Const(1.0),
                Op::Add,
                Op::StoreOut,
            ],
        };
        let module = Module {
            precision: Precision::Float,
            functions: vec![twice],
            body,
        };

        let input = [0.0, 1.0, 2.0, 3.0, 10.0, 11.0, 12.0, 13.0];
        let positions: [[f64; 3]; 0] = [];
        let mut machine = Machine::default();
        let value = machine.run(&module, &item(&input, &positions)).unwrap();
        assert_eq!(value, 27.0);
    }

    #[test]
    fn test_corrupt_bytecode_is_an_error() {
        let module = Module {
            precision: Precision::Double,
            functions: Vec::new(),
            body: Function {
                name: "montage".to_string(),
                params: 0,
                locals: 0,
                code: vec![Op::Add],
            },
        };
        let input = [0.0f32; 8];
        let positions: [[f64; 3]; 0] = [];
        let mut machine = Machine::default();
        assert!(machine.run(&module, &item(&input, &positions)).is_err());
    }
}
