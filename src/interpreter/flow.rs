use super::Interpreter;
use crate::error::RuntimeError;
use crate::jit::{self, IrKind, JitState, JIT_EXIT_DEOPT, JIT_EXIT_YIELD};
use crate::profiler::InstructionLocation;
use crate::registers::TypedTag;
use crate::value::{Value, ValueKind};

fn tag_matches(tag: TypedTag, kind: IrKind) -> bool {
    matches!(
        (tag, kind),
        (TypedTag::I32, IrKind::I32)
            | (TypedTag::I64, IrKind::I64)
            | (TypedTag::U32, IrKind::U32)
            | (TypedTag::U64, IrKind::U64)
            | (TypedTag::F64, IrKind::F64)
            | (TypedTag::Bool, IrKind::Bool)
    )
}

impl Interpreter {
    /// Forward jump by an unsigned offset from the post-operand ip.
    ///
    /// Out-of-bounds targets are suspicious compiler output: they are
    /// logged and ignored rather than crashing. During shutdown every jump
    /// is a no-op.
    pub(crate) fn jump_forward(&mut self, offset: usize) {
        if self.is_shutting_down {
            return;
        }

        let target = self.ip.saturating_add(offset);
        if target > self.chunk.len() {
            tracing::warn!(offset, target, len = self.chunk.len(), "ignoring out-of-bounds jump");
            return;
        }
        self.ip = target;
    }

    /// Backward jump: the offset is subtracted from the instruction
    /// pointer. This is the loop back-edge and a safepoint.
    pub(crate) fn jump_back(&mut self, offset: usize) -> Result<(), RuntimeError> {
        if self.is_shutting_down {
            return Ok(());
        }

        let Some(target) = self.ip.checked_sub(offset) else {
            tracing::warn!(offset, ip = self.ip, "ignoring out-of-bounds backward jump");
            return Ok(());
        };

        self.ip = target;
        self.back_edge(target)
    }

    /// Everything that happens at a loop back-edge: safepoint, loop-safety
    /// guard, profiling, tiering and the JIT entry-cache consult.
    fn back_edge(&mut self, header: usize) -> Result<(), RuntimeError> {
        self.safepoint();
        self.note_loop_iteration(header)?;

        let location = InstructionLocation::new(self.current_function, header as u32);
        let iterations = self.profiler.record_loop_iteration(location);

        // A fused increment-loop tail in the window justifies translating
        // before the generic threshold.
        let fused_hint = self.profiler.fusion().inc_loop_candidate().is_some()
            && iterations * 2 == self.params.hot_loop_threshold;

        if self.profiler.loop_just_became_hot(iterations) || fused_hint {
            self.compile_hot_loop(header);
        }

        if self.profiler.is_loop_hot(iterations) {
            self.try_enter_jit(header)?;
        }

        Ok(())
    }

    /// Progressive loop guard. Sampled every `loop_guard_stride`
    /// iterations; warns once at the warning threshold and raises at the
    /// configured ceiling. `max_iterations = 0` disables it entirely.
    fn note_loop_iteration(&mut self, header: usize) -> Result<(), RuntimeError> {
        if !self.params.loop_guard_enabled() {
            return Ok(());
        }

        if self.loop_header != Some(header) {
            self.loop_header = Some(header);
            self.loop_iterations = 0;
            self.loop_warned = false;
        }

        self.loop_iterations += 1;
        if self.loop_iterations % self.params.loop_guard_stride != 0 {
            return Ok(());
        }

        self.check_loop_guard(header)
    }

    fn check_loop_guard(&mut self, header: usize) -> Result<(), RuntimeError> {
        if self.loop_iterations >= self.params.max_iterations {
            return Err(RuntimeError::loop_iteration_limit(self.loop_iterations));
        }

        if !self.loop_warned && self.loop_iterations >= self.params.loop_warn_at {
            tracing::warn!(
                iterations = self.loop_iterations,
                header,
                "loop passed the progressive guard warning threshold"
            );
            self.loop_warned = true;
        }

        Ok(())
    }

    /// Account iterations a compiled loop ran natively, then re-check the
    /// guard thresholds it may have jumped past.
    fn credit_loop_iterations(&mut self, header: usize, n: u64) -> Result<(), RuntimeError> {
        if n == 0 || !self.params.loop_guard_enabled() {
            return Ok(());
        }
        if self.loop_header != Some(header) {
            self.loop_header = Some(header);
            self.loop_iterations = 0;
            self.loop_warned = false;
        }
        self.loop_iterations += n;
        self.check_loop_guard(header)
    }

    /* fused loop opcodes */

    /// `IncCmpJmp counter, limit, back`: increment the counter, branch back
    /// while `counter < limit`. Operates in the typed bank; the boxed
    /// fallback behaves identically.
    pub(crate) fn inc_cmp_jmp(&mut self) -> Result<(), RuntimeError> {
        let counter = self.fetch_reg()?;
        let limit = self.fetch_reg()?;
        let offset = self.fetch_u16()? as usize;

        if let (Some(c), Some(l)) = (
            self.registers.try_read_i32(counter),
            self.registers.try_read_i32(limit),
        ) {
            let next = c
                .checked_add(1)
                .ok_or_else(|| RuntimeError::integer_overflow(ValueKind::I32))?;
            self.registers.store_i32_hot(counter, next);
            if next < l {
                return self.jump_back(offset);
            }
            return Ok(());
        }

        if let (Some(c), Some(l)) = (
            self.registers.try_read_i64(counter),
            self.registers.try_read_i64(limit),
        ) {
            let next = c
                .checked_add(1)
                .ok_or_else(|| RuntimeError::integer_overflow(ValueKind::I64))?;
            self.registers.store_i64_hot(counter, next);
            if next < l {
                return self.jump_back(offset);
            }
            return Ok(());
        }

        // Boxed fallback.
        let c = self.reg(counter)?;
        let l = self.reg(limit)?;
        match (c, l) {
            (Value::I32(c), Value::I32(l)) => {
                let next = c
                    .checked_add(1)
                    .ok_or_else(|| RuntimeError::integer_overflow(ValueKind::I32))?;
                self.registers.store_i32(counter, next);
                if next < l {
                    return self.jump_back(offset);
                }
                Ok(())
            }
            (Value::I64(c), Value::I64(l)) => {
                let next = c
                    .checked_add(1)
                    .ok_or_else(|| RuntimeError::integer_overflow(ValueKind::I64))?;
                self.registers.store_i64(counter, next);
                if next < l {
                    return self.jump_back(offset);
                }
                Ok(())
            }
            (c, l) => Err(RuntimeError::mixed_arithmetic(c.kind(), l.kind())),
        }
    }

    /// `DecCmpJmp counter, floor, back`: decrement the counter, branch back
    /// while `counter > floor`.
    pub(crate) fn dec_cmp_jmp(&mut self) -> Result<(), RuntimeError> {
        let counter = self.fetch_reg()?;
        let floor = self.fetch_reg()?;
        let offset = self.fetch_u16()? as usize;

        if let (Some(c), Some(l)) = (
            self.registers.try_read_i32(counter),
            self.registers.try_read_i32(floor),
        ) {
            let next = c
                .checked_sub(1)
                .ok_or_else(|| RuntimeError::integer_overflow(ValueKind::I32))?;
            self.registers.store_i32_hot(counter, next);
            if next > l {
                return self.jump_back(offset);
            }
            return Ok(());
        }

        if let (Some(c), Some(l)) = (
            self.registers.try_read_i64(counter),
            self.registers.try_read_i64(floor),
        ) {
            let next = c
                .checked_sub(1)
                .ok_or_else(|| RuntimeError::integer_overflow(ValueKind::I64))?;
            self.registers.store_i64_hot(counter, next);
            if next > l {
                return self.jump_back(offset);
            }
            return Ok(());
        }

        let c = self.reg(counter)?;
        let l = self.reg(floor)?;
        match (c, l) {
            (Value::I32(c), Value::I32(l)) => {
                let next = c
                    .checked_sub(1)
                    .ok_or_else(|| RuntimeError::integer_overflow(ValueKind::I32))?;
                self.registers.store_i32(counter, next);
                if next > l {
                    return self.jump_back(offset);
                }
                Ok(())
            }
            (Value::I64(c), Value::I64(l)) => {
                let next = c
                    .checked_sub(1)
                    .ok_or_else(|| RuntimeError::integer_overflow(ValueKind::I64))?;
                self.registers.store_i64(counter, next);
                if next > l {
                    return self.jump_back(offset);
                }
                Ok(())
            }
            (c, l) => Err(RuntimeError::mixed_arithmetic(c.kind(), l.kind())),
        }
    }

    /* tiering */

    fn compile_hot_loop(&mut self, header: usize) {
        if !self.jit.enabled() {
            return;
        }

        let function = self.current_function;
        if !self.jit.begin_translation(function, header as u32) {
            return;
        }

        match jit::compile_loop(&self.chunk, header, self.jit.stage()) {
            Ok(compiled) => {
                // The code bakes in a kind per slot; install only while the
                // live typed tags agree, and snapshot their generations so
                // any later retag invalidates the entry.
                let tags_match = compiled
                    .kinds
                    .iter()
                    .all(|&(slot, kind)| tag_matches(self.registers.typed().tag(slot as usize), kind));
                if !tags_match {
                    tracing::debug!(function, header, "typed tags drifted before install");
                    self.jit
                        .record_failure(function, header as u32, jit::TranslationFailure::UnsupportedValueKind);
                    return;
                }

                let guard_slots: Vec<(u16, u32)> = compiled
                    .kinds
                    .iter()
                    .map(|&(slot, _)| (slot, self.registers.generation(slot as u32)))
                    .collect();
                let generation = self.jit.install(function, header as u32, compiled, guard_slots);
                tracing::debug!(function, header, generation, "compiled hot loop");
            }
            Err(failure) => {
                tracing::debug!(function, header, ?failure, "loop translation failed");
                self.jit.record_failure(function, header as u32, failure);
            }
        }
    }

    /// Consult the entry cache for `(current function, loop header)` and
    /// transfer control to native code when a live entry matches.
    ///
    /// Native code exits past the loop (completed), through the
    /// deoptimization protocol (restoring the interpreter ip and
    /// invalidating the entry), or by exhausting its iteration budget, in
    /// which case the interpreter resumes at the header with the consumed
    /// iterations credited to the loop guard.
    fn try_enter_jit(&mut self, header: usize) -> Result<bool, RuntimeError> {
        let function = self.current_function;
        let Some(entry) = self.jit.entry(function, header as u32) else {
            return Ok(false);
        };

        let generation = entry.generation();
        let entry_fn = entry.entry_fn();
        let guard_slots = entry.guard_slots().to_vec();
        let written_slots = entry.written_slots().to_vec();

        for (slot, expected) in guard_slots {
            if self.registers.generation(slot as u32) != expected {
                self.jit.invalidate(function, header as u32, generation);
                return Ok(false);
            }
        }

        // Native entry is a safepoint: the boxed window must be
        // authoritative before we hand out typed-bank pointers.
        self.registers.reconcile_all();
        self.safepoint();

        let budget = if self.params.loop_guard_enabled() {
            self.params.loop_guard_stride.max(1)
        } else {
            u64::MAX
        };

        let banks = self.registers.typed_bank_pointers();
        let mut state = JitState {
            i32s: banks.i32s,
            i64s: banks.i64s,
            u32s: banks.u32s,
            u64s: banks.u64s,
            f64s: banks.f64s,
            bools: banks.bools,
            ip: header as u64,
            exit: 0,
            deopt_reason: 0,
            budget,
        };

        // Safety: the entry was compiled for this chunk and its guard
        // generations were just verified; the state pointers outlive the
        // call and native code only touches the typed banks.
        unsafe { entry_fn(&mut state) };

        for slot in written_slots {
            self.registers.mark_typed_dirty(slot as u32);
        }
        self.ip = state.ip as usize;

        let consumed = budget - state.budget;
        self.profiler.credit_loop_iterations(
            InstructionLocation::new(function, header as u32),
            consumed,
        );
        self.credit_loop_iterations(header, consumed)?;

        match state.exit {
            JIT_EXIT_DEOPT => {
                tracing::debug!(
                    function,
                    header,
                    reason = state.deopt_reason,
                    resume_ip = self.ip,
                    "deoptimizing compiled loop"
                );
                self.jit.invalidate(function, header as u32, generation);
                Ok(false)
            }
            JIT_EXIT_YIELD => Ok(false),
            _ => Ok(true),
        }
    }
}
