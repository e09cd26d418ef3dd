//! Statement lowering.
//!
//! Each statement kind maps to one IR node. Branching constructs fork a
//! child flow, compile into it and merge the results back; loops and
//! switches draw their labels from a monotonically increasing
//! break-context counter so nested constructs never collide.

use crate::compiler::ast;
use crate::compiler::codegen::{Compiler, ConversionKind};
use crate::compiler::diagnostics::{CompileError, DiagnosticCode};
use crate::compiler::flow::{Flow, FlowFlags};
use crate::compiler::program::ElementFlags;
use crate::compiler::tokens::TextLocation;
use crate::compiler::wir::nodes::{BinaryOp, ExprRef, NativeType};

impl<'a> Compiler<'a> {
    pub fn compile_statement(&mut self, statement: &ast::Statement) -> Result<ExprRef, CompileError> {
        let location = &statement.location;
        let compiled = match &statement.kind {
            ast::StatementKind::Block(statements) => self.compile_block(statements)?,
            ast::StatementKind::Empty => self.module.nop(),
            ast::StatementKind::Expression(expression) => {
                let void = self.void_type();
                self.compile_expression(expression, &void, ConversionKind::Implicit, false)?
            }
            ast::StatementKind::If {
                condition,
                if_true,
                if_false,
            } => self.compile_if(condition, if_true, if_false.as_deref())?,
            ast::StatementKind::While { condition, body } => {
                self.compile_while(condition, body)?
            }
            ast::StatementKind::DoWhile { body, condition } => {
                self.compile_do_while(body, condition)?
            }
            ast::StatementKind::For {
                initializer,
                condition,
                incrementor,
                body,
            } => self.compile_for(
                initializer.as_deref(),
                condition.as_ref(),
                incrementor.as_ref(),
                body,
            )?,
            ast::StatementKind::Switch { condition, cases } => {
                self.compile_switch(condition, cases, location)?
            }
            ast::StatementKind::Return(value) => {
                self.compile_return(value.as_ref(), location)?
            }
            ast::StatementKind::Break(label) => self.compile_break(label.as_deref(), location),
            ast::StatementKind::Continue(label) => {
                self.compile_continue(label.as_deref(), location)
            }
            ast::StatementKind::Throw(_) => self.compile_throw(location)?,
            ast::StatementKind::Try { .. } => {
                let void = self.void_type();
                self.operation_not_supported("try/catch/finally", location, &void)
            }
            ast::StatementKind::Variable(variable) => {
                self.compile_local_variable(variable, location)?
            }
            ast::StatementKind::Declaration(_) | ast::StatementKind::Import { .. } => {
                let void = self.void_type();
                self.operation_not_supported("A nested declaration", location, &void)
            }
        };
        if self.options.source_map {
            self.module.set_debug_location(compiled, location);
        }
        Ok(compiled)
    }

    pub fn compile_statements(
        &mut self,
        statements: &[ast::Statement],
    ) -> Result<Vec<ExprRef>, CompileError> {
        let mut compiled = Vec::with_capacity(statements.len());
        for statement in statements {
            compiled.push(self.compile_statement(statement)?);
        }
        Ok(compiled)
    }

    // =========================================================================
    // Blocks
    // =========================================================================

    fn compile_block(&mut self, statements: &[ast::Statement]) -> Result<ExprRef, CompileError> {
        self.current_flow = Flow::fork(std::mem::take(&mut self.current_flow));
        let compiled = self.compile_statements(statements);
        let (mut parent, child) = std::mem::take(&mut self.current_flow).free();
        parent.inherit(&child);
        self.current_flow = parent;
        let compiled = compiled?;

        Ok(match compiled.len() {
            0 => self.module.nop(),
            1 => compiled[0],
            _ => {
                let ty = self.module.expr_type(*compiled.last().unwrap());
                self.module.block(None, compiled, ty)
            }
        })
    }

    // =========================================================================
    // Conditionals
    // =========================================================================

    fn compile_if(
        &mut self,
        condition: &ast::Expression,
        if_true: &ast::Statement,
        if_false: Option<&ast::Statement>,
    ) -> Result<ExprRef, CompileError> {
        let bool_type = self.bool_type();
        let condition_expr =
            self.compile_expression(condition, &bool_type, ConversionKind::None, false)?;
        let condition_type = self.current_type.clone();
        let condition_expr = self.make_is_trueish(condition_expr, &condition_type);

        // A constant condition elides the dead arm entirely. Generic
        // bodies compile per instance, so elision is always safe here.
        if let Some(value) = self.module.precompute(condition_expr) {
            let live = if value.is_zero() {
                if_false
            } else {
                Some(if_true)
            };
            return match live {
                Some(statement) => {
                    self.current_flow = Flow::fork(std::mem::take(&mut self.current_flow));
                    let compiled = self.compile_statement(statement);
                    let (mut parent, child) = std::mem::take(&mut self.current_flow).free();
                    parent.inherit(&child);
                    self.current_flow = parent;
                    compiled
                }
                None => Ok(self.module.nop()),
            };
        }

        self.current_flow = Flow::fork(std::mem::take(&mut self.current_flow));
        let then_expr = self.compile_statement(if_true);
        let (parent, then_flow) = std::mem::take(&mut self.current_flow).free();
        self.current_flow = parent;
        let then_expr = then_expr?;

        match if_false {
            Some(if_false) => {
                self.current_flow = Flow::fork(std::mem::take(&mut self.current_flow));
                let else_expr = self.compile_statement(if_false);
                let (mut parent, else_flow) = std::mem::take(&mut self.current_flow).free();
                let else_expr = else_expr?;
                parent.inherit_mutual(&then_flow, &else_flow);
                self.current_flow = parent;
                Ok(self
                    .module
                    .if_(condition_expr, then_expr, Some(else_expr), NativeType::None))
            }
            None => {
                self.current_flow.inherit_conditional(&then_flow);
                Ok(self
                    .module
                    .if_(condition_expr, then_expr, None, NativeType::None))
            }
        }
    }

    // =========================================================================
    // Loops
    // =========================================================================

    /// Strip the break/continue bits a loop consumes before its flow
    /// merges outward.
    fn consume_loop_flags(flow: &mut Flow) {
        flow.flags.clear(FlowFlags::BREAKS);
        flow.flags.clear(FlowFlags::CONDITIONALLY_BREAKS);
        flow.flags.clear(FlowFlags::CONTINUES);
        flow.flags.clear(FlowFlags::CONDITIONALLY_CONTINUES);
    }

    fn compile_while(
        &mut self,
        condition: &ast::Expression,
        body: &ast::Statement,
    ) -> Result<ExprRef, CompileError> {
        let context = self.enter_break_context();
        let break_label = format!("break|{}", context);
        let continue_label = format!("continue|{}", context);

        let mut child = Flow::fork(std::mem::take(&mut self.current_flow));
        child.break_label = Some(break_label.clone());
        child.continue_label = Some(continue_label.clone());
        self.current_flow = child;

        let bool_type = self.bool_type();
        let result = (|| {
            let condition_expr =
                self.compile_expression(condition, &bool_type, ConversionKind::None, false)?;
            let condition_type = self.current_type.clone();
            let falseish = self.make_is_falseish(condition_expr, &condition_type);
            let always_true = matches!(
                self.module.precompute(falseish),
                Some(value) if value.is_zero()
            );
            let body_expr = self.compile_statement(body)?;
            Ok::<_, CompileError>((falseish, always_true, body_expr))
        })();

        let (mut parent, mut child) = std::mem::take(&mut self.current_flow).free();
        let (falseish, always_true, body_expr) = match result {
            Ok(parts) => parts,
            Err(e) => {
                self.current_flow = parent;
                self.exit_break_context();
                return Err(e);
            }
        };
        let body_terminates = child.flags.has_any(FlowFlags::ANY_TERMINATING);
        Self::consume_loop_flags(&mut child);
        if always_true {
            parent.inherit(&child);
        } else {
            parent.inherit_conditional(&child);
        }
        self.current_flow = parent;
        self.exit_break_context();

        // block break|N { loop continue|N { br_if break|N (!cond); body;
        // br continue|N } }
        let mut loop_children = vec![self
            .module
            .break_(break_label.clone(), Some(falseish), None)];
        loop_children.push(body_expr);
        if !body_terminates {
            loop_children.push(self.module.break_(continue_label.clone(), None, None));
        }
        let loop_body = self.module.block(None, loop_children, NativeType::None);
        let looped = self.module.loop_(Some(continue_label), loop_body);
        Ok(self
            .module
            .block(Some(break_label), vec![looped], NativeType::None))
    }

    fn compile_do_while(
        &mut self,
        body: &ast::Statement,
        condition: &ast::Expression,
    ) -> Result<ExprRef, CompileError> {
        let context = self.enter_break_context();
        let break_label = format!("break|{}", context);
        let continue_label = format!("continue|{}", context);

        let mut child = Flow::fork(std::mem::take(&mut self.current_flow));
        child.break_label = Some(break_label.clone());
        child.continue_label = Some(continue_label.clone());
        self.current_flow = child;

        let body_expr = self.compile_statement(body);
        let body_terminates = self
            .current_flow
            .flags
            .has_any(FlowFlags::ANY_TERMINATING);

        // A terminating body makes the trailing condition unreachable;
        // it is elided rather than compiled dead.
        let bool_type = self.bool_type();
        let condition_expr = if body_terminates {
            None
        } else {
            let compiled =
                self.compile_expression(condition, &bool_type, ConversionKind::None, false)?;
            let condition_type = self.current_type.clone();
            Some(self.make_is_trueish(compiled, &condition_type))
        };

        let (mut parent, mut child) = std::mem::take(&mut self.current_flow).free();
        let body_expr = match body_expr {
            Ok(body_expr) => body_expr,
            Err(e) => {
                self.current_flow = parent;
                self.exit_break_context();
                return Err(e);
            }
        };
        Self::consume_loop_flags(&mut child);
        // The body executes at least once.
        parent.inherit(&child);
        self.current_flow = parent;
        self.exit_break_context();

        let mut loop_children = vec![body_expr];
        if let Some(condition_expr) = condition_expr {
            loop_children.push(self.module.break_(
                continue_label.clone(),
                Some(condition_expr),
                None,
            ));
        }
        let loop_body = self.module.block(None, loop_children, NativeType::None);
        let looped = self.module.loop_(Some(continue_label), loop_body);
        Ok(self
            .module
            .block(Some(break_label), vec![looped], NativeType::None))
    }

    fn compile_for(
        &mut self,
        initializer: Option<&ast::Statement>,
        condition: Option<&ast::Expression>,
        incrementor: Option<&ast::Expression>,
        body: &ast::Statement,
    ) -> Result<ExprRef, CompileError> {
        let context = self.enter_break_context();
        let break_label = format!("break|{}", context);
        let continue_label = format!("continue|{}", context);
        let repeat_label = format!("repeat|{}", context);

        let mut child = Flow::fork(std::mem::take(&mut self.current_flow));
        child.break_label = Some(break_label.clone());
        child.continue_label = Some(continue_label.clone());
        self.current_flow = child;

        let bool_type = self.bool_type();
        let void_type = self.void_type();
        let result = (|| {
            let init_expr = match initializer {
                Some(initializer) => Some(self.compile_statement(initializer)?),
                None => None,
            };
            let condition_parts = match condition {
                Some(condition) => {
                    let compiled = self.compile_expression(
                        condition,
                        &bool_type,
                        ConversionKind::None,
                        false,
                    )?;
                    let condition_type = self.current_type.clone();
                    let falseish = self.make_is_falseish(compiled, &condition_type);
                    let always_true = matches!(
                        self.module.precompute(falseish),
                        Some(value) if value.is_zero()
                    );
                    Some((falseish, always_true))
                }
                None => None, // no condition is an always-true condition
            };
            let body_expr = self.compile_statement(body)?;
            let incrementor_expr = match incrementor {
                Some(incrementor) => Some(self.compile_expression(
                    incrementor,
                    &void_type,
                    ConversionKind::Implicit,
                    false,
                )?),
                None => None,
            };
            Ok::<_, CompileError>((init_expr, condition_parts, body_expr, incrementor_expr))
        })();

        let (mut parent, mut child) = std::mem::take(&mut self.current_flow).free();
        let (init_expr, condition_parts, body_expr, incrementor_expr) = match result {
            Ok(parts) => parts,
            Err(e) => {
                self.current_flow = parent;
                self.exit_break_context();
                return Err(e);
            }
        };
        let body_terminates = child.flags.has_any(FlowFlags::ANY_TERMINATING);
        Self::consume_loop_flags(&mut child);
        let always_true = match &condition_parts {
            Some((_, always_true)) => *always_true,
            None => true,
        };
        if always_true {
            parent.inherit(&child);
        } else {
            parent.inherit_conditional(&child);
        }
        self.current_flow = parent;
        self.exit_break_context();

        // block break|N { init; loop repeat|N { br_if break|N (!cond);
        // block continue|N { body }; incrementor; br repeat|N } }
        let mut loop_children = Vec::new();
        if let Some((falseish, _)) = condition_parts {
            loop_children.push(self.module.break_(break_label.clone(), Some(falseish), None));
        }
        let body_wrapped =
            self.module
                .block(Some(continue_label), vec![body_expr], NativeType::None);
        loop_children.push(body_wrapped);
        if let Some(incrementor_expr) = incrementor_expr {
            loop_children.push(incrementor_expr);
        }
        if !(body_terminates && incrementor.is_none()) {
            loop_children.push(self.module.break_(repeat_label.clone(), None, None));
        }
        let loop_body = self.module.block(None, loop_children, NativeType::None);
        let looped = self.module.loop_(Some(repeat_label), loop_body);
        let mut outer = Vec::new();
        if let Some(init_expr) = init_expr {
            outer.push(init_expr);
        }
        outer.push(looped);
        Ok(self
            .module
            .block(Some(break_label), outer, NativeType::None))
    }

    // =========================================================================
    // Switch
    // =========================================================================

    fn compile_switch(
        &mut self,
        condition: &ast::Expression,
        cases: &[ast::SwitchCase],
        location: &TextLocation,
    ) -> Result<ExprRef, CompileError> {
        let context = self.enter_break_context();
        let break_label = format!("break|{}", context);

        // The condition evaluates once into a temp.
        let i32_type = self.i32_type();
        let condition_expr =
            self.compile_expression(condition, &i32_type, ConversionKind::Implicit, true)?;
        let temp = self
            .program
            .function_mut(self.current_function)
            .get_temp_local(i32_type.clone());

        let default_index = cases.iter().position(|case| case.label.is_none());

        // Dispatch block: tee the condition, then one br_if per labelled
        // case, then a br to the default (or out).
        let mut dispatch = Vec::with_capacity(cases.len() + 1);
        let tee = self.module.tee_local(temp, condition_expr, NativeType::I32);
        let mut first_compare = Some(tee);
        for (index, case) in cases.iter().enumerate() {
            let Some(label) = &case.label else { continue };
            let label_expr =
                self.compile_expression(label, &i32_type, ConversionKind::Implicit, true)?;
            let left = first_compare
                .take()
                .unwrap_or_else(|| self.module.get_local(temp, NativeType::I32));
            let compare = self.module.binary(BinaryOp::EqI32, left, label_expr);
            dispatch.push(self.module.break_(
                format!("case{}|{}", index, context),
                Some(compare),
                None,
            ));
        }
        if let Some(tee) = first_compare {
            // No labelled cases at all; the tee still evaluates the
            // condition for effect.
            let dropped = self.module.drop_(tee);
            dispatch.push(dropped);
        }
        let default_target = match default_index {
            Some(index) => format!("case{}|{}", index, context),
            None => break_label.clone(),
        };
        dispatch.push(self.module.break_(default_target, None, None));

        // Nest the cases inside chained labelled blocks so fall-through
        // works: each case's statements live after its label's block.
        let mut current = self
            .module
            .block(Some(format!("case0|{}", context)), dispatch, NativeType::None);
        let mut case_flows = Vec::with_capacity(cases.len());
        for (index, case) in cases.iter().enumerate() {
            // The continue label stays inherited so `continue` inside a
            // case still targets the enclosing loop.
            let mut child = Flow::fork(std::mem::take(&mut self.current_flow));
            child.break_label = Some(break_label.clone());
            self.current_flow = child;
            let statements = self.compile_statements(&case.statements);
            let (parent, case_flow) = std::mem::take(&mut self.current_flow).free();
            self.current_flow = parent;
            let mut statements = statements?;
            case_flows.push(case_flow);

            let label = if index + 1 < cases.len() {
                Some(format!("case{}|{}", index + 1, context))
            } else {
                Some(break_label.clone())
            };
            let mut children = vec![current];
            children.append(&mut statements);
            current = self.module.block(label, children, NativeType::None);
        }
        if cases.is_empty() {
            // Even an empty switch needs its break frame for the
            // dispatch's fallback branch.
            current = self
                .module
                .block(Some(break_label.clone()), vec![current], NativeType::None);
        }
        self.exit_break_context();

        // With a default every path is covered: bits proven in all arms
        // inherit unconditionally. Breaks are consumed by the switch.
        if default_index.is_some() && !case_flows.is_empty() {
            let mut common = FlowFlags::NONE;
            for flag in [
                FlowFlags::RETURNS,
                FlowFlags::RETURNS_WRAPPED,
                FlowFlags::THROWS,
                FlowFlags::ALLOCATES,
            ] {
                if case_flows.iter().all(|flow| flow.flags.has(flag)) {
                    common.set(flag);
                }
            }
            self.current_flow.flags.union_with(common);
        }
        for flow in &case_flows {
            let mut cleaned = Flow::default();
            cleaned.flags = flow.flags;
            cleaned.flags.clear(FlowFlags::BREAKS);
            cleaned.flags.clear(FlowFlags::CONDITIONALLY_BREAKS);
            self.current_flow.inherit_conditional(&cleaned);
        }

        self.program
            .function_mut(self.current_function)
            .free_temp_local(temp);
        if self.options.source_map {
            self.module.set_debug_location(current, location);
        }
        Ok(current)
    }

    // =========================================================================
    // Return, break, continue, throw
    // =========================================================================

    fn compile_return(
        &mut self,
        value: Option<&ast::Expression>,
        location: &TextLocation,
    ) -> Result<ExprRef, CompileError> {
        let return_type = self
            .current_flow
            .return_type
            .clone()
            .unwrap_or_else(|| self.void_type());
        let exported = self
            .program
            .element(self.current_function)
            .flags
            .has(ElementFlags::EXPORT);

        let value_expr = match value {
            Some(value) if !return_type.is_void() => {
                // Exported functions wrap returned values by default so
                // host callers never see garbage bits.
                let compiled = self.compile_expression(
                    value,
                    &return_type,
                    ConversionKind::Implicit,
                    exported,
                )?;
                if !self.expr_can_overflow(compiled, &return_type) {
                    self.current_flow.flags.set(FlowFlags::RETURNS_WRAPPED);
                }
                Some(compiled)
            }
            Some(value) => {
                // Returning a value from a void function drops it.
                let void = self.void_type();
                let dropped =
                    self.compile_expression(value, &void, ConversionKind::Implicit, false)?;
                self.current_flow.flags.set(FlowFlags::RETURNS);
                let ret = if self.current_flow.is_inline() {
                    let label = self
                        .current_flow
                        .return_label
                        .clone()
                        .ok_or_else(|| CompileError::internal("inline flow has no return label"))?;
                    self.module.break_(label, None, None)
                } else {
                    self.module.ret(None)
                };
                return Ok(self
                    .module
                    .block(None, vec![dropped, ret], NativeType::None));
            }
            None => {
                if !return_type.is_void() {
                    self.error(
                        DiagnosticCode::TypeExpected,
                        format!("A function returning '{}' must return a value", return_type),
                        location,
                    );
                }
                None
            }
        };

        self.current_flow.flags.set(FlowFlags::RETURNS);
        if self.current_flow.is_inline() {
            // Inside an inlined body a return is a break to the inline
            // return label.
            let label = self
                .current_flow
                .return_label
                .clone()
                .ok_or_else(|| CompileError::internal("inline flow has no return label"))?;
            return Ok(self.module.break_(label, None, value_expr));
        }
        Ok(self.module.ret(value_expr))
    }

    fn compile_break(&mut self, label: Option<&str>, location: &TextLocation) -> ExprRef {
        if label.is_some() {
            let void = self.void_type();
            return self.operation_not_supported("A labelled break", location, &void);
        }
        let Some(break_label) = self.current_flow.break_label.clone() else {
            self.error(
                DiagnosticCode::BreakOutsideLoop,
                "A 'break' statement can only be used within a loop or switch",
                location,
            );
            return self.module.unreachable();
        };
        self.current_flow.flags.set(FlowFlags::BREAKS);
        self.module.break_(break_label, None, None)
    }

    fn compile_continue(&mut self, label: Option<&str>, location: &TextLocation) -> ExprRef {
        if label.is_some() {
            let void = self.void_type();
            return self.operation_not_supported("A labelled continue", location, &void);
        }
        let Some(continue_label) = self.current_flow.continue_label.clone() else {
            self.error(
                DiagnosticCode::ContinueOutsideLoop,
                "A 'continue' statement can only be used within a loop",
                location,
            );
            return self.module.unreachable();
        };
        self.current_flow.flags.set(FlowFlags::CONTINUES);
        self.module.break_(continue_label, None, None)
    }

    fn compile_throw(&mut self, location: &TextLocation) -> Result<ExprRef, CompileError> {
        // Pending an exception ABI, a throw is an abort: it also counts
        // as returning because no code after it runs.
        self.current_flow.flags.set(FlowFlags::THROWS);
        self.current_flow.flags.set(FlowFlags::RETURNS);
        crate::compiler::builtins::make_abort(self, None, location)
    }

    // =========================================================================
    // Local variables
    // =========================================================================

    fn compile_local_variable(
        &mut self,
        variable: &ast::VariableDeclaration,
        location: &TextLocation,
    ) -> Result<ExprRef, CompileError> {
        let is_const = variable.modifiers.contains(&ast::Modifier::Const);
        let mut initializers: Vec<ExprRef> = Vec::new();

        for declarator in &variable.declarations {
            if self.current_flow.has_own_scoped_local(&declarator.name) {
                self.error(
                    DiagnosticCode::DuplicateIdentifier,
                    format!("Duplicate identifier '{}'", declarator.name),
                    &declarator.location,
                );
                continue;
            }
            let contextual_args = self.current_flow.contextual_type_arguments.clone();
            let declared_type = match &declarator.type_node {
                Some(node) => self.program.resolve_type(node, &contextual_args, true),
                None => None,
            };

            let init = match &declarator.initializer {
                Some(initializer) => {
                    let (contextual, conversion) = match &declared_type {
                        Some(ty) => (ty.clone(), ConversionKind::Implicit),
                        None => (self.void_type(), ConversionKind::None),
                    };
                    Some(self.compile_expression(
                        initializer,
                        &contextual,
                        conversion,
                        false,
                    )?)
                }
                None => None,
            };
            let ty = match declared_type {
                Some(ty) => ty,
                None => {
                    if init.is_none() {
                        self.error(
                            DiagnosticCode::TypeExpected,
                            format!(
                                "'{}' needs a type annotation or an initializer",
                                declarator.name
                            ),
                            &declarator.location,
                        );
                        continue;
                    }
                    self.current_type.clone()
                }
            };
            if ty.is_void() {
                self.error(
                    DiagnosticCode::VoidNotAllowed,
                    "A variable cannot be of type 'void'",
                    &declarator.location,
                );
                continue;
            }

            if is_const {
                let Some(init) = init else {
                    self.error(
                        DiagnosticCode::ConstMissingInitializer,
                        "'const' declarations must be initialized",
                        &declarator.location,
                    );
                    continue;
                };
                // A const whose value precomputes becomes a virtual
                // local: no slot, reads substitute the literal.
                if let Some(value) = self.module.precompute(init) {
                    self.current_flow
                        .add_virtual_local(&declarator.name, ty, value);
                    continue;
                }
                let index = self
                    .program
                    .function_mut(self.current_function)
                    .add_local(&declarator.name, ty.clone());
                self.current_flow
                    .add_scoped_const_local(&declarator.name, index, ty.clone());
                let wrapped = !self.expr_can_overflow(init, &ty);
                self.current_flow.set_local_wrapped(index, wrapped);
                initializers.push(self.module.set_local(index, init));
                continue;
            }

            let index = self
                .program
                .function_mut(self.current_function)
                .add_local(&declarator.name, ty.clone());
            self.current_flow
                .add_scoped_local(&declarator.name, index, ty.clone());
            if let Some(init) = init {
                let wrapped = !self.expr_can_overflow(init, &ty);
                self.current_flow.set_local_wrapped(index, wrapped);
                initializers.push(self.module.set_local(index, init));
            }
        }

        let compiled = match initializers.len() {
            0 => self.module.nop(),
            1 => initializers[0],
            _ => self.module.block(None, initializers, NativeType::None),
        };
        if self.options.source_map {
            self.module.set_debug_location(compiled, location);
        }
        Ok(compiled)
    }

    /// A zero constant of the pointer width (the null pointer).
    pub(crate) fn pointer_zero(&mut self) -> ExprRef {
        if self.pointer_native_type() == NativeType::I64 {
            self.module.i64(0)
        } else {
            self.module.i32(0)
        }
    }
}
