// crates/core/src/syntax_check.rs

//! Static check of capability source.
//!
//! The parser accepts some modules that CPython's `compile()` refuses:
//! `return` at module level, `break` outside a loop, module-level `nonlocal`,
//! assignment to a call and so on. Those are caught here with a walk over the
//! parsed tree, so a module that could never load is rejected before any
//! process is spawned.

use rustpython_parser::ast::{self, Expr, Ranged, Stmt};
use rustpython_parser::Parse;

/// Parse `source` and apply the compile-time rules the parser leaves out.
pub fn check_module(source: &str) -> Result<(), String> {
    let suite =
        ast::Suite::parse(source, "<candidate>").map_err(|e| format!("SyntaxError: {}", e))?;
    Checker { source }.block(&suite, Scope::MODULE)
}

/// What encloses the statement being checked.
#[derive(Debug, Clone, Copy)]
struct Scope {
    /// Directly inside a function body.
    function: bool,
    /// Directly inside an `async def` body.
    coroutine: bool,
    /// Somewhere inside a function, possibly under a class body.
    enclosed: bool,
    in_loop: bool,
}

impl Scope {
    const MODULE: Scope = Scope {
        function: false,
        coroutine: false,
        enclosed: false,
        in_loop: false,
    };

    fn function(coroutine: bool) -> Scope {
        Scope {
            function: true,
            coroutine,
            enclosed: true,
            in_loop: false,
        }
    }

    fn class_body(self) -> Scope {
        Scope {
            function: false,
            coroutine: false,
            in_loop: false,
            ..self
        }
    }

    fn looping(self) -> Scope {
        Scope {
            in_loop: true,
            ..self
        }
    }
}

struct Checker<'a> {
    source: &'a str,
}

impl Checker<'_> {
    fn error(&self, stmt: &Stmt, message: &str) -> String {
        let offset = stmt.start().to_usize().min(self.source.len());
        let line = self
            .source
            .get(..offset)
            .map_or(1, |before| before.matches('\n').count() + 1);
        format!("SyntaxError: {} (line {})", message, line)
    }

    fn block(&self, body: &[Stmt], scope: Scope) -> Result<(), String> {
        body.iter().try_for_each(|stmt| self.stmt(stmt, scope))
    }

    fn stmt(&self, stmt: &Stmt, scope: Scope) -> Result<(), String> {
        let fail = |message: &str| Err(self.error(stmt, message));
        match stmt {
            Stmt::FunctionDef(ast::StmtFunctionDef { body, .. }) => {
                self.block(body, Scope::function(false))
            }
            Stmt::AsyncFunctionDef(ast::StmtAsyncFunctionDef { body, .. }) => {
                self.block(body, Scope::function(true))
            }
            Stmt::ClassDef(ast::StmtClassDef { body, .. }) => self.block(body, scope.class_body()),
            Stmt::Return(ast::StmtReturn { value, .. }) => {
                if !scope.function {
                    return fail("'return' outside function");
                }
                self.opt_expr(stmt, value.as_deref(), scope)
            }
            Stmt::Break(_) if !scope.in_loop => fail("'break' outside loop"),
            Stmt::Continue(_) if !scope.in_loop => fail("'continue' not properly in loop"),
            Stmt::Nonlocal(_) if !scope.enclosed => {
                fail("nonlocal declaration not allowed at module level")
            }
            Stmt::Delete(ast::StmtDelete { targets, .. }) => targets
                .iter()
                .try_for_each(|target| self.target(stmt, target, "delete")),
            Stmt::Assign(ast::StmtAssign { targets, value, .. }) => {
                for target in targets {
                    self.target(stmt, target, "assign to")?;
                }
                self.expr(stmt, value, scope)
            }
            Stmt::AugAssign(ast::StmtAugAssign { target, value, .. }) => {
                if !matches!(
                    target.as_ref(),
                    Expr::Name(_) | Expr::Attribute(_) | Expr::Subscript(_)
                ) {
                    return fail("illegal expression for augmented assignment");
                }
                self.expr(stmt, value, scope)
            }
            Stmt::AnnAssign(ast::StmtAnnAssign { target, value, .. }) => {
                self.target(stmt, target, "assign to")?;
                self.opt_expr(stmt, value.as_deref(), scope)
            }
            Stmt::AsyncFor(_) if !scope.coroutine => fail("'async for' outside async function"),
            Stmt::AsyncWith(_) if !scope.coroutine => fail("'async with' outside async function"),
            Stmt::For(ast::StmtFor {
                target,
                iter,
                body,
                orelse,
                ..
            })
            | Stmt::AsyncFor(ast::StmtAsyncFor {
                target,
                iter,
                body,
                orelse,
                ..
            }) => {
                self.target(stmt, target, "assign to")?;
                self.expr(stmt, iter, scope)?;
                self.block(body, scope.looping())?;
                self.block(orelse, scope)
            }
            Stmt::While(ast::StmtWhile {
                test, body, orelse, ..
            }) => {
                self.expr(stmt, test, scope)?;
                self.block(body, scope.looping())?;
                self.block(orelse, scope)
            }
            Stmt::If(ast::StmtIf {
                test, body, orelse, ..
            }) => {
                self.expr(stmt, test, scope)?;
                self.block(body, scope)?;
                self.block(orelse, scope)
            }
            Stmt::With(ast::StmtWith { items, body, .. })
            | Stmt::AsyncWith(ast::StmtAsyncWith { items, body, .. }) => {
                for item in items {
                    self.expr(stmt, &item.context_expr, scope)?;
                    if let Some(vars) = &item.optional_vars {
                        self.target(stmt, vars, "assign to")?;
                    }
                }
                self.block(body, scope)
            }
            Stmt::Match(ast::StmtMatch { subject, cases, .. }) => {
                self.expr(stmt, subject, scope)?;
                cases
                    .iter()
                    .try_for_each(|case| self.block(&case.body, scope))
            }
            Stmt::Try(ast::StmtTry {
                body,
                handlers,
                orelse,
                finalbody,
                ..
            })
            | Stmt::TryStar(ast::StmtTryStar {
                body,
                handlers,
                orelse,
                finalbody,
                ..
            }) => {
                self.block(body, scope)?;
                for handler in handlers {
                    match handler {
                        ast::ExceptHandler::ExceptHandler(handler) => {
                            self.block(&handler.body, scope)?
                        }
                    }
                }
                self.block(orelse, scope)?;
                self.block(finalbody, scope)
            }
            Stmt::Expr(ast::StmtExpr { value, .. }) => self.expr(stmt, value, scope),
            _ => Ok(()),
        }
    }

    fn opt_expr(&self, stmt: &Stmt, expr: Option<&Expr>, scope: Scope) -> Result<(), String> {
        expr.map_or(Ok(()), |expr| self.expr(stmt, expr, scope))
    }

    fn exprs(&self, stmt: &Stmt, exprs: &[Expr], scope: Scope) -> Result<(), String> {
        exprs.iter().try_for_each(|expr| self.expr(stmt, expr, scope))
    }

    /// Walk an expression for `yield` and `await` in the wrong place. Lambda and
    /// comprehension bodies are their own scopes and are not entered.
    fn expr(&self, stmt: &Stmt, expr: &Expr, scope: Scope) -> Result<(), String> {
        match expr {
            Expr::Yield(ast::ExprYield { value, .. }) => {
                if !scope.function {
                    return Err(self.error(stmt, "'yield' outside function"));
                }
                self.opt_expr(stmt, value.as_deref(), scope)
            }
            Expr::YieldFrom(ast::ExprYieldFrom { value, .. }) => {
                if !scope.function {
                    return Err(self.error(stmt, "'yield' outside function"));
                }
                if scope.coroutine {
                    return Err(self.error(stmt, "'yield from' inside async function"));
                }
                self.expr(stmt, value, scope)
            }
            Expr::Await(ast::ExprAwait { value, .. }) => {
                if !scope.function {
                    return Err(self.error(stmt, "'await' outside function"));
                }
                if !scope.coroutine {
                    return Err(self.error(stmt, "'await' outside async function"));
                }
                self.expr(stmt, value, scope)
            }
            Expr::NamedExpr(ast::ExprNamedExpr { target, value, .. }) => {
                if !matches!(target.as_ref(), Expr::Name(_)) {
                    return Err(self.error(stmt, "cannot use assignment expressions here"));
                }
                self.expr(stmt, value, scope)
            }
            Expr::BoolOp(ast::ExprBoolOp { values, .. }) => self.exprs(stmt, values, scope),
            Expr::BinOp(ast::ExprBinOp { left, right, .. }) => {
                self.expr(stmt, left, scope)?;
                self.expr(stmt, right, scope)
            }
            Expr::UnaryOp(ast::ExprUnaryOp { operand, .. }) => self.expr(stmt, operand, scope),
            Expr::IfExp(ast::ExprIfExp {
                test, body, orelse, ..
            }) => {
                self.expr(stmt, test, scope)?;
                self.expr(stmt, body, scope)?;
                self.expr(stmt, orelse, scope)
            }
            Expr::Compare(ast::ExprCompare {
                left, comparators, ..
            }) => {
                self.expr(stmt, left, scope)?;
                self.exprs(stmt, comparators, scope)
            }
            Expr::Call(ast::ExprCall {
                func,
                args,
                keywords,
                ..
            }) => {
                self.expr(stmt, func, scope)?;
                self.exprs(stmt, args, scope)?;
                keywords
                    .iter()
                    .try_for_each(|keyword| self.expr(stmt, &keyword.value, scope))
            }
            Expr::Attribute(ast::ExprAttribute { value, .. })
            | Expr::Starred(ast::ExprStarred { value, .. }) => self.expr(stmt, value, scope),
            Expr::Subscript(ast::ExprSubscript { value, slice, .. }) => {
                self.expr(stmt, value, scope)?;
                self.expr(stmt, slice, scope)
            }
            Expr::List(ast::ExprList { elts, .. }) | Expr::Tuple(ast::ExprTuple { elts, .. }) => {
                self.exprs(stmt, elts, scope)
            }
            _ => Ok(()),
        }
    }

    fn target(&self, stmt: &Stmt, target: &Expr, verb: &str) -> Result<(), String> {
        match target {
            Expr::Name(_) | Expr::Attribute(_) | Expr::Subscript(_) => Ok(()),
            Expr::Starred(ast::ExprStarred { value, .. }) => self.target(stmt, value, verb),
            Expr::List(ast::ExprList { elts, .. }) | Expr::Tuple(ast::ExprTuple { elts, .. }) => {
                elts.iter()
                    .try_for_each(|elt| self.target(stmt, elt, verb))
            }
            other => Err(self.error(stmt, &format!("cannot {} {}", verb, describe(other)))),
        }
    }
}

fn describe(expr: &Expr) -> &'static str {
    match expr {
        Expr::Call(_) => "function call",
        Expr::Constant(_) => "literal",
        Expr::Compare(_) => "comparison",
        Expr::Lambda(_) => "lambda",
        Expr::Await(_) => "await expression",
        Expr::Yield(_) | Expr::YieldFrom(_) => "yield expression",
        Expr::NamedExpr(_) => "named expression",
        _ => "expression",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rejected(source: &str) -> String {
        check_module(source).expect_err("source should be rejected")
    }

    #[test]
    fn accepts_ordinary_capability() {
        let source = r#"
import json

class Counter:
    total = 0

    def bump(self, n):
        for i in range(n):
            if i > 3:
                break
            self.total += i
        return self.total

def run(**kwargs):
    def inner():
        nonlocal kwargs
        kwargs = {}
    while True:
        try:
            value = yield kwargs
        finally:
            continue
    return {"success": True, "output": json.dumps(kwargs)}

async def fetch(x):
    async with x as conn:
        return await conn.get()
"#;
        assert_eq!(check_module(source), Ok(()));
    }

    #[test]
    fn parse_errors_are_reported() {
        assert!(rejected("def add(a, b)\n    return a + b\n").starts_with("SyntaxError"));
    }

    #[test]
    fn return_outside_function() {
        let err = rejected("return 1\ndef f():\n    return 2\n");
        assert_eq!(err, "SyntaxError: 'return' outside function (line 1)");

        let err = rejected("class C:\n    return 1\n");
        assert!(err.contains("'return' outside function"));
    }

    #[test]
    fn break_and_continue_outside_loop() {
        let err = rejected("def f():\n    return 1\nbreak\n");
        assert_eq!(err, "SyntaxError: 'break' outside loop (line 3)");

        // A loop outside the function does not count inside it.
        let err = rejected("for i in x:\n    def f():\n        continue\n");
        assert!(err.contains("'continue' not properly in loop"));
    }

    #[test]
    fn nonlocal_at_module_level() {
        let err = rejected("x = 1\nnonlocal x\n");
        assert!(err.contains("nonlocal declaration not allowed at module level"));
    }

    #[test]
    fn assignment_to_call() {
        let err = rejected("def f():\n    return 1\nf() = 3\n");
        assert_eq!(err, "SyntaxError: cannot assign to function call (line 3)");

        assert!(rejected("a, f() = 1, 2\n").contains("function call"));
        assert!(rejected("for f() in x:\n    pass\n").contains("function call"));
        assert!(rejected("f() += 1\n").contains("augmented assignment"));
    }

    #[test]
    fn yield_and_await_outside_function() {
        assert!(rejected("x = yield 1\n").contains("'yield' outside function"));
        assert!(rejected("await thing()\n").contains("'await' outside function"));
        assert!(rejected("def f():\n    await g()\n").contains("'await' outside async function"));
        assert!(rejected("async for x in y:\n    pass\n").contains("'async for'"));
    }
}
