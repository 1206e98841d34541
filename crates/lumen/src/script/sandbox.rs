use super::bytecode::{
    Constant, Prototype,
    instruction::{
        OP_CALL, OP_CLOSE, OP_CONCAT, OP_EXTRAARG, OP_FORLOOP, OP_GEI, OP_GETUPVAL,
        OP_LOADK, OP_LOADKX, OP_LOADNIL, OP_MMBIN, OP_MMBINK, OP_MOVE, OP_RETURN, OP_RETURN1,
        OP_SELF, OP_SETFIELD, OP_SETI, OP_SETLIST, OP_SETTABLE, OP_SETTABUP, OP_SETUPVAL,
        OP_TAILCALL, OP_TEST, OP_TFORLOOP, OP_VARARG, a, ax, b, bx, opcode,
    },
};

/// A write to the global environment found in compiled code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalAssignment {
    pub name: String,
    pub line: u32,
}

impl std::fmt::Display for GlobalAssignment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "assignment to undeclared variable '{}'", self.name)
    }
}

/// Collects every assignment to an undeclared variable in `main` and all of
/// its nested functions, ordered by line.
///
/// Most global writes compile to `SETTABUP _ENV`. Names that are long strings
/// or whose constant index does not fit an operand instead copy `_ENV` into a
/// register first and store through it, so register copies of `_ENV` are
/// followed as well.
#[must_use]
pub fn global_assignments(main: &Prototype) -> Vec<GlobalAssignment> {
    let mut found = Vec::new();
    scan(main, true, &mut found);
    found.sort_by_key(|g| g.line);
    found
}

/// What the scan knows about one register.
#[derive(Debug, Clone, Copy, Default)]
struct Slot {
    /// Holds the `_ENV` table.
    env: bool,
    /// Holds the constant at this index.
    constant: Option<usize>,
}

struct Registers([Slot; 256]);

impl Registers {
    const fn new() -> Self {
        Self(
            [Slot {
                env: false,
                constant: None,
            }; 256],
        )
    }

    fn get(&self, r: usize) -> Slot {
        self.0.get(r).copied().unwrap_or_default()
    }

    fn set(&mut self, r: usize, slot: Slot) {
        if let Some(s) = self.0.get_mut(r) {
            *s = slot;
        }
    }

    /// Forgets `r` and every register above it.
    fn clobber_from(&mut self, r: usize) {
        for s in self.0.iter_mut().skip(r) {
            *s = Slot::default();
        }
    }
}

fn constant_name(proto: &Prototype, index: usize) -> String {
    match proto.constants.get(index) {
        Some(Constant::Integer(i)) => i.to_string(),
        Some(constant) => constant.as_str().unwrap_or("?").to_string(),
        None => "?".to_string(),
    }
}

fn scan(proto: &Prototype, is_main: bool, found: &mut Vec<GlobalAssignment>) {
    let env = proto
        .upvalue_names
        .iter()
        .position(|name| name.as_deref() == Some("_ENV"))
        .or_else(|| is_main.then_some(0));

    if let Some(env) = env {
        let mut regs = Registers::new();
        let mut report = |pc: usize, name: String| {
            found.push(GlobalAssignment {
                name,
                line: proto.line_at(pc).unwrap_or(proto.line_defined),
            });
        };

        for (pc, &ins) in proto.code.iter().enumerate() {
            let op = opcode(ins);
            let ra = a(ins);
            match op {
                OP_SETTABUP => {
                    if ra == env {
                        report(pc, constant_name(proto, b(ins)));
                    }
                }
                OP_SETTABLE => {
                    if regs.get(ra).env {
                        let name = regs
                            .get(b(ins))
                            .constant
                            .map_or_else(|| "?".to_string(), |i| constant_name(proto, i));
                        report(pc, name);
                    }
                }
                OP_SETFIELD => {
                    if regs.get(ra).env {
                        report(pc, constant_name(proto, b(ins)));
                    }
                }
                OP_SETI => {
                    if regs.get(ra).env {
                        report(pc, b(ins).to_string());
                    }
                }
                OP_GETUPVAL => regs.set(
                    ra,
                    Slot {
                        env: b(ins) == env,
                        constant: None,
                    },
                ),
                OP_MOVE => regs.set(ra, regs.get(b(ins))),
                OP_LOADK => regs.set(
                    ra,
                    Slot {
                        env: false,
                        constant: Some(bx(ins)),
                    },
                ),
                OP_LOADKX => {
                    let constant = proto
                        .code
                        .get(pc + 1)
                        .filter(|next| opcode(**next) == OP_EXTRAARG)
                        .map(|next| ax(*next));
                    regs.set(ra, Slot { env: false, constant });
                }
                // these leave registers untouched
                OP_SETUPVAL
                | OP_MMBIN..=OP_MMBINK
                | OP_CLOSE..=OP_GEI
                | OP_TEST
                | OP_RETURN..=OP_RETURN1
                | OP_SETLIST
                | OP_EXTRAARG => {}
                // these write or use as scratch every register from A up
                OP_LOADNIL
                | OP_SELF
                | OP_CONCAT
                | OP_CALL
                | OP_TAILCALL
                | OP_FORLOOP..=OP_TFORLOOP
                | OP_VARARG => regs.clobber_from(ra),
                _ => regs.set(ra, Slot::default()),
            }
        }
    }

    for child in &proto.protos {
        scan(child, false, found);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::bytecode::parse;

    fn check(source: &str) -> Vec<GlobalAssignment> {
        let lua = mlua::Lua::new();
        let chunk = lua
            .load(source)
            .set_name("@check.lua")
            .into_function()
            .expect("compile")
            .dump(false);
        global_assignments(&parse(&chunk).expect("parse"))
    }

    #[test]
    fn rejects_top_level_assignment() {
        assert_eq!(
            check("x = 1"),
            vec![GlobalAssignment {
                name: "x".into(),
                line: 1
            }]
        );
    }

    #[test]
    fn accepts_locals() {
        assert!(check("local x = 1\nx = 2\nlocal t = {}\nt.y = x").is_empty());
    }

    #[test]
    fn reading_globals_is_allowed() {
        assert!(check("local n = tostring(math.pi)\nprint(n)").is_empty());
    }

    #[test]
    fn rejects_inside_nested_functions() {
        let found = check(
            "local function outer()\n  local function inner()\n    counter = 1\n  end\n  return inner\nend\nreturn outer",
        );
        assert_eq!(
            found,
            vec![GlobalAssignment {
                name: "counter".into(),
                line: 3
            }]
        );
    }

    #[test]
    fn upvalue_writes_are_allowed() {
        assert!(check("local n = 0\nlocal function bump() n = n + 1 end\nbump()").is_empty());
    }

    #[test]
    fn global_function_declaration_is_an_assignment() {
        let found = check("function handler() end");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "handler");
    }

    #[test]
    fn explicit_env_write_is_rejected() {
        assert_eq!(check("_ENV.z = 1").len(), 1);
    }

    #[test]
    fn rejects_long_global_names() {
        let name = "a".repeat(45);
        let found = check(&format!("local x = 1\n{name} = x"));
        assert_eq!(found, vec![GlobalAssignment { name, line: 2 }]);
    }

    #[test]
    fn rejects_globals_past_the_constant_operand_range() {
        let strings: Vec<String> = (0..300).map(|i| format!("'s{i}'")).collect();
        let source = format!("local t = {{ {} }}\nleaked = 1", strings.join(", "));
        assert_eq!(
            check(&source),
            vec![GlobalAssignment {
                name: "leaked".into(),
                line: 2
            }]
        );
    }

    #[test]
    fn rejects_writes_through_env_copies() {
        let found = check("local e = _ENV\nlocal f = e\nf.x = 1\ne[1] = 2");
        let names: Vec<_> = found.iter().map(|g| (g.name.as_str(), g.line)).collect();
        assert_eq!(names, vec![("x", 3), ("1", 4)]);
    }

    #[test]
    fn register_tables_stay_allowed() {
        let long = "k".repeat(45);
        let source = format!(
            "local t = {{}}\nt['{long}'] = 1\nlocal v = {long}\nfor i = 1, 3 do t[i] = i end\nlocal e = _ENV\ne = {{}}\ne.y = v"
        );
        assert!(check(&source).is_empty());
    }
}
