use std::collections::HashMap;

use lyn::{
    ByteBuffer,
    EventKind,
    EventObject,
    MappingKind,
    Output,
    Relocation,
    Section,
    Symbol,
};

const R_ARM_ABS32: u32 = 0x02;
const R_ARM_REL32: u32 = 0x03;
const R_ARM_THM_CALL: u32 = 0x0A;
const R_ARM_CALL: u32 = 0x1C;

fn section_with_bytes(name: &str, bytes: &[u8]) -> Section {
    Section::with_data(name, Output::Rom, ByteBuffer::from(bytes.to_vec()))
}

fn render(object: &EventObject) -> String {
    let mut out = Vec::new();
    object.write_events(&mut out).unwrap();
    String::from_utf8(out).unwrap()
}

/// Evaluates the expression grammar produced for unresolved references:
/// fully parenthesized left-associative arithmetic over symbols, decimal
/// numbers, `$HEX` literals and the operators `+ - >> & |`. All arithmetic
/// wraps in 32 bits, matching the byte-baking path.
fn eval(expr: &str, env: &HashMap<&str, u32>) -> u32 {
    let tokens = tokenize(expr);
    let (value, rest) = eval_expr(&tokens, env);
    assert!(rest.is_empty(), "trailing tokens in {:?}", expr);
    value
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Open,
    Close,
    Op(String),
    Value(String),
}

fn tokenize(expr: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut chars = expr.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '(' => tokens.push(Token::Open),
            ')' => tokens.push(Token::Close),
            '+' | '-' | '&' | '|' => tokens.push(Token::Op(c.to_string())),
            '>' => {
                assert_eq!(chars.next(), Some('>'));
                tokens.push(Token::Op(">>".to_string()));
            },
            _ => {
                let mut value = c.to_string();

                while let Some(&next) = chars.peek() {
                    if matches!(next, '(' | ')' | '+' | '-' | '&' | '|' | '>') {
                        break;
                    }

                    value.push(next);
                    chars.next();
                }

                tokens.push(Token::Value(value));
            },
        }
    }

    tokens
}

fn eval_expr<'a>(tokens: &'a [Token], env: &HashMap<&str, u32>) -> (u32, &'a [Token]) {
    let (mut value, mut rest) = eval_atom(tokens, env);

    while let Some(Token::Op(op)) = rest.first() {
        let (operand, after) = eval_atom(&rest[1..], env);

        value = match op.as_str() {
            "+" => value.wrapping_add(operand),
            "-" => value.wrapping_sub(operand),
            ">>" => value >> operand,
            "&" => value & operand,
            "|" => value | operand,
            _ => unreachable!(),
        };

        rest = after;
    }

    (value, rest)
}

fn eval_atom<'a>(tokens: &'a [Token], env: &HashMap<&str, u32>) -> (u32, &'a [Token]) {
    match tokens.first().expect("empty expression") {
        Token::Open => {
            let (value, rest) = eval_expr(&tokens[1..], env);
            assert_eq!(rest.first(), Some(&Token::Close));
            (value, &rest[1..])
        },
        Token::Value(text) => {
            let value = if let Some(hex) = text.strip_prefix('$') {
                u32::from_str_radix(hex, 16).unwrap()
            } else if text.chars().all(|c| c.is_ascii_digit()) {
                text.parse().unwrap()
            } else {
                *env.get(text.as_str()).unwrap_or_else(|| panic!("unbound symbol {}", text))
            };

            (value, &tokens[1..])
        },
        other => panic!("unexpected token {:?}", other),
    }
}

#[test]
fn test_two_instruction_merge_scenario() {
    let mut mov = section_with_bytes(".text", &[0x00, 0x00, 0xA0, 0xE3]);
    mov.set_mapping(0, MappingKind::Arm);

    let mut ret = section_with_bytes(".text", &[0x0E, 0xF0, 0xA0, 0xE1]);
    ret.set_mapping(0, MappingKind::Arm);

    let mut object = EventObject::new();
    object.append_section(mov);
    object.append_section(ret);

    assert_eq!(object.section().size(), 8);
    assert_eq!(object.section().mapping_at(0), MappingKind::Arm);

    // no symbols or relocations: pruning is a no-op
    object.prune_symbols();
    assert!(object.section().symbols().is_empty());

    assert_eq!(render(&object), "WORD $E3A00000 $E1A0F00E\n");
}

#[test]
fn test_resolved_thumb_call_emits_literals() {
    let mut section = section_with_bytes(".text", &[0; 0x204]);
    section.set_mapping(0, MappingKind::Thumb);
    section.add_symbol(Symbol {
        name: "foo".into(),
        offset: 0x200,
    });
    section.add_relocation(Relocation {
        symbol: "foo".into(),
        addend: 0,
        code: R_ARM_THM_CALL,
        offset: 0x100,
    });

    let mut object = EventObject::new();
    object.append_section(section);
    object.link_locals().unwrap();
    object.prune_symbols();

    assert!(object.section().relocations().is_empty());
    assert!(object.section().symbols().is_empty());

    let output = render(&object);
    assert!(output.contains("$F000 $F87E"), "{}", output);
}

#[test]
fn test_unresolved_thumb_call_emits_expressions() {
    let mut section = section_with_bytes(".text", &[0; 4]);
    section.set_mapping(0, MappingKind::Thumb);
    section.add_relocation(Relocation {
        symbol: "far_away".into(),
        addend: 0,
        code: R_ARM_THM_CALL,
        offset: 0,
    });

    let mut object = EventObject::new();
    object.append_section(section);
    object.link_locals().unwrap();

    assert_eq!(
        render(&object),
        "SHORT ((((far_away-4-CURRENTOFFSET)>>12)&$7FF)|$F000) \
         ((((far_away-4-CURRENTOFFSET)>>1)&$7FF)|$F800)\n"
    );
}

#[test]
fn test_trampoline_redirection() {
    let mut section = section_with_bytes(".text", &[0; 4]);
    section.set_mapping(0, MappingKind::Thumb);
    section.add_relocation(Relocation {
        symbol: "far_away".into(),
        addend: 0,
        code: R_ARM_THM_CALL,
        offset: 0,
    });

    let mut object = EventObject::new();
    object.append_section(section);
    object.link_locals().unwrap();
    object.make_trampolines().unwrap();

    // blob grew by the 16-byte veneer right after the original 4 bytes
    assert_eq!(object.section().size(), 20);

    // the call now lands on the veneer entry at offset 4
    let op1 = object.section().data().read(0, 2).unwrap();
    let op2 = object.section().data().read(2, 2).unwrap();
    let displacement = (((op1 & 0x7FF) << 12) | ((op2 & 0x7FF) << 1)) as i32;
    assert_eq!(displacement, 4 - 0 - 4);

    // the veneer body is in place and its literal slot is still pending
    assert_eq!(object.section().data().read(4, 2).unwrap(), 0x4778);
    assert_eq!(object.section().relocations().len(), 1);
    assert_eq!(object.section().relocations()[0].offset, 4 + 0x0C);
    assert_eq!(object.section().relocations()[0].symbol, "far_away");

    // resolving the literal makes the whole chain reach the true target
    object.add_absolute(Symbol {
        name: "far_away".into(),
        offset: 0x0812_3456,
    });
    object.link_absolutes().unwrap();

    assert!(object.section().relocations().is_empty());
    assert_eq!(object.section().data().read(4 + 0x0C, 4).unwrap(), 0x0812_3456);
}

#[test]
fn test_trampolines_are_shared_per_target() {
    let mut section = section_with_bytes(".text", &[0; 12]);
    section.set_mapping(0, MappingKind::Thumb);

    for offset in [0, 4] {
        section.add_relocation(Relocation {
            symbol: "far_away".into(),
            addend: 0,
            code: R_ARM_THM_CALL,
            offset,
        });
    }

    section.add_relocation(Relocation {
        symbol: "far_away".into(),
        addend: 2,
        code: R_ARM_THM_CALL,
        offset: 8,
    });

    let mut object = EventObject::new();
    object.append_section(section);
    object.make_trampolines().unwrap();

    // two distinct (symbol, addend) targets: two veneers, three resolved calls
    assert_eq!(object.section().size(), 12 + 16 + 16);
    assert_eq!(object.section().relocations().len(), 2);
}

#[test]
fn test_symbolic_matches_applied_abs32() {
    for addend in [0_i32, 1000, -1000] {
        let mut pending = section_with_bytes(".data", &[0; 4]);
        pending.add_relocation(Relocation {
            symbol: "sym".into(),
            addend,
            code: R_ARM_ABS32,
            offset: 0,
        });

        let mut symbolic = EventObject::new();
        symbolic.append_section(pending);

        let events = symbolic.make_events().unwrap();
        let (_, code) = &events.codes()[0];
        assert_eq!(code.kind(), EventKind::Poin);

        let value = 0x0803_1337;
        let env = HashMap::from([("sym", value)]);

        let mut baked = section_with_bytes(".data", &[0; 4]);
        baked.add_symbol(Symbol {
            name: "sym".into(),
            offset: value,
        });
        baked.add_relocation(Relocation {
            symbol: "sym".into(),
            addend,
            code: R_ARM_ABS32,
            offset: 0,
        });

        let mut resolved = EventObject::new();
        resolved.append_section(baked);
        resolved.link_locals().unwrap();

        assert_eq!(eval(&code.exprs()[0], &env), resolved.section().data().read(0, 4).unwrap());
    }
}

#[test]
fn test_symbolic_matches_applied_rel32() {
    let offset = 8_u32;
    let value = 0x0000_4000_u32;

    let mut pending = section_with_bytes(".data", &[0; 12]);
    pending.add_relocation(Relocation {
        symbol: "sym".into(),
        addend: 12,
        code: R_ARM_REL32,
        offset,
    });

    let mut symbolic = EventObject::new();
    symbolic.append_section(pending);

    let events = symbolic.make_events().unwrap();
    let expr = &events.codes().last().unwrap().1.exprs()[0];

    let env = HashMap::from([("sym", value), ("CURRENTOFFSET", offset)]);

    let mut baked = section_with_bytes(".data", &[0; 12]);
    baked.add_symbol(Symbol {
        name: "sym".into(),
        offset: value,
    });
    baked.add_relocation(Relocation {
        symbol: "sym".into(),
        addend: 12,
        code: R_ARM_REL32,
        offset,
    });

    let mut resolved = EventObject::new();
    resolved.append_section(baked);
    resolved.link_locals().unwrap();

    assert_eq!(eval(expr, &env), resolved.section().data().read(offset, 4).unwrap());
}

#[test]
fn test_symbolic_matches_applied_arm_call() {
    let value = 0x1_0000_u32;
    let bl_placeholder = 0xEBFF_FFFE_u32;

    let mut pending = section_with_bytes(".text", &[0; 4]);
    pending.set_mapping(0, MappingKind::Arm);
    pending.data_mut().write(0, 4, bl_placeholder).unwrap();
    pending.add_relocation(Relocation {
        symbol: "sym".into(),
        addend: 0,
        code: R_ARM_CALL,
        offset: 0,
    });

    let mut symbolic = EventObject::new();
    symbolic.append_section(pending);

    let events = symbolic.make_events().unwrap();
    let expr = &events.codes()[0].1.exprs()[0];

    let env = HashMap::from([("sym", value), ("CURRENTOFFSET", 0)]);

    let mut baked = section_with_bytes(".text", &[0; 4]);
    baked.data_mut().write(0, 4, bl_placeholder).unwrap();
    baked.add_symbol(Symbol {
        name: "sym".into(),
        offset: value,
    });
    baked.add_relocation(Relocation {
        symbol: "sym".into(),
        addend: 0,
        code: R_ARM_CALL,
        offset: 0,
    });

    let mut resolved = EventObject::new();
    resolved.append_section(baked);
    resolved.link_locals().unwrap();

    let baked_word = resolved.section().data().read(0, 4).unwrap();
    assert_eq!(baked_word >> 24, 0xEB);
    assert_eq!(eval(expr, &env), baked_word);
}

#[test]
fn test_hook_blocks_and_blob_output() {
    let mut section = section_with_bytes(".text", &[0x70, 0x47]);
    section.set_mapping(0, MappingKind::Thumb);
    section.add_symbol(Symbol {
        name: "hook_080123ED".into(),
        offset: 0,
    });

    let mut object = EventObject::new();
    object.append_section(section);
    object.link_locals().unwrap();
    object.prune_symbols();

    let hooks = object.hooks();
    assert_eq!(hooks.len(), 1);
    assert_eq!(hooks[0].address, 0x0801_23ED);

    let mut out = Vec::new();
    lyn::write_hook_events(&mut out, &hooks).unwrap();
    object.write_events(&mut out).unwrap();
    let output = String::from_utf8(out).unwrap();

    assert_eq!(
        output,
        "PUSH\n\
         ORG $80123EC\n\
         SHORT $4778 $46C0\n\
         WORD $E59FC000 $E12FFF1C\n\
         POIN hook_080123ED\n\
         POP\n\
         SHORT $4770\n"
    );
}
