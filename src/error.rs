use miette::{miette, LabeledSpan, Report, Severity};

use crate::span::Span;

// Lexer errors

pub fn lex_unknown(span: Span, src: &str) -> Report {
    miette!(
        severity = Severity::Error,
        code = "lex::unknown",
        help = "numbers are decimal or 0x-prefixed hex; identifiers start with a letter or underscore.",
        labels = vec![LabeledSpan::at(span, "unknown token")],
        "Encountered an unknown token",
    )
    .with_source_code(src.to_string())
}

pub fn bad_number(text: &str, span: Span, src: &str) -> Report {
    miette!(
        severity = Severity::Error,
        code = "asm::bad_number",
        help = "values from -65536 to 65535 are allowed",
        labels = vec![LabeledSpan::at(span, "incorrect literal")],
        "Malformed numeric literal `{text}`",
    )
    .with_source_code(src.to_string())
}

// Parser errors

pub fn unexpected_token(expected: &str, span: Span, src: &str) -> Report {
    miette!(
        severity = Severity::Error,
        code = "parse::unexpected_token",
        help = "check the operands for this statement.",
        labels = vec![LabeledSpan::at(span, "unexpected token")],
        "Expected {expected}",
    )
    .with_source_code(src.to_string())
}

pub fn duplicate_label(name: &str, span: Span, src: &str) -> Report {
    miette!(
        severity = Severity::Error,
        code = "asm::duplicate_label",
        help = "labels may only be defined once per program",
        labels = vec![LabeledSpan::at(span, "duplicate label")],
        "Duplicate label `{name}`",
    )
    .with_source_code(src.to_string())
}

pub fn misplaced_directive(name: &str, span: Span, src: &str) -> Report {
    miette!(
        severity = Severity::Error,
        code = "asm::directive",
        help = "EQU defines the value of the label preceding it, e.g. `TEN: EQU 10`",
        labels = vec![LabeledSpan::at(span, "directive without a label")],
        "{name} requires a label on the same statement",
    )
    .with_source_code(src.to_string())
}

// Encoder errors

pub fn undefined_label(name: &str, span: Span, src: &str) -> Report {
    miette!(
        severity = Severity::Error,
        code = "asm::undefined_label",
        help = "labels are case-insensitive and must be defined with a trailing `:` or via EQU",
        labels = vec![LabeledSpan::at(span, "unresolved symbol")],
        "Undefined label `{name}`",
    )
    .with_source_code(src.to_string())
}

pub fn invalid_operands(mnemonic: &str, operands: &str, span: Span, src: &str) -> Report {
    miette!(
        severity = Severity::Error,
        code = "asm::invalid_operands",
        help = "no encoding of this instruction accepts these operands.",
        labels = vec![LabeledSpan::at(span, "unencodable statement")],
        "Invalid operands for {mnemonic}: {operands}",
    )
    .with_source_code(src.to_string())
}

pub fn relative_range(offset: i32, span: Span, src: &str) -> Report {
    miette!(
        severity = Severity::Error,
        code = "asm::relative_range",
        help = "relative jumps reach -128 to +127 bytes from the following instruction; use JP for longer hops",
        labels = vec![LabeledSpan::at(span, "target out of reach")],
        "Relative jump offset {offset} exceeds a signed byte",
    )
    .with_source_code(src.to_string())
}

pub fn value_range(val: i64, what: &str, span: Span, src: &str) -> Report {
    miette!(
        severity = Severity::Error,
        code = "asm::value_range",
        help = "check the width this operand position allows",
        labels = vec![LabeledSpan::at(span, "out-of-range value")],
        "Value {val} does not fit in {what}",
    )
    .with_source_code(src.to_string())
}
