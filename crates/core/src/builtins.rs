// crates/core/src/builtins.rs

//! Hand-authored starter capabilities, admitted at startup without testing.
//!
//! Every built-in follows the generated-capability contract:
//! `entry(**kwargs) -> {"success": bool, "output": ...}`.

use std::collections::BTreeMap;

use serde_json::{json, Value};

use crate::types::{Arguments, Candidate, TestCase};

const TEXT_ANALYZE: &str = r#"def text_analyze(**kwargs):
    import re
    text = kwargs.get("text") or kwargs.get("task", "")
    if not text:
        return {"success": False, "output": None, "error": "text is required"}
    words = text.split()
    sentences = [s for s in re.split(r"[.!?]", text) if s.strip()]
    paragraphs = [p for p in text.split("\n\n") if p.strip()]
    freq = {}
    for w in words:
        w = re.sub(r"[^\w]", "", w.lower())
        if len(w) > 3:
            freq[w] = freq.get(w, 0) + 1
    top = sorted(freq.items(), key=lambda kv: kv[1], reverse=True)[:10]
    return {
        "success": True,
        "output": {
            "chars": len(text),
            "words": len(words),
            "sentences": len(sentences),
            "paragraphs": len(paragraphs),
            "top_keywords": [{"word": w, "count": c} for w, c in top],
        },
    }
"#;

const MATH_EVAL: &str = r#"def math_eval(**kwargs):
    import math
    expr = kwargs.get("expression", "")
    if not expr:
        return {"success": False, "output": None, "error": "expression is required"}
    allowed = {
        "abs": abs, "round": round, "min": min, "max": max, "sum": sum, "pow": pow,
        "sqrt": math.sqrt, "log": math.log, "log10": math.log10, "log2": math.log2,
        "sin": math.sin, "cos": math.cos, "tan": math.tan,
        "floor": math.floor, "ceil": math.ceil, "factorial": math.factorial,
        "pi": math.pi, "e": math.e,
    }
    try:
        result = eval(expr, {"__builtins__": {}}, allowed)
    except ZeroDivisionError:
        return {"success": False, "output": None, "error": "division by zero"}
    except Exception as exc:
        return {"success": False, "output": None, "error": str(exc)}
    return {"success": True, "output": {"expression": expr, "result": result}}
"#;

const JSON_QUERY: &str = r#"def json_query(**kwargs):
    import json
    raw = kwargs.get("json_string", "")
    query = kwargs.get("query", "")
    try:
        data = json.loads(raw)
    except Exception as exc:
        return {"success": False, "output": None, "error": "invalid JSON: %s" % exc}
    if not query:
        return {"success": True, "output": data}
    node = data
    for part in query.split("."):
        if isinstance(node, list) and part.isdigit() and int(part) < len(node):
            node = node[int(part)]
        elif isinstance(node, dict) and part in node:
            node = node[part]
        else:
            return {"success": False, "output": None, "error": "path not found: %s" % query}
    return {"success": True, "output": node}
"#;

const STRING_TRANSFORM: &str = r#"def string_transform(**kwargs):
    text = kwargs.get("text", "")
    op = kwargs.get("operation", "")
    ops = {
        "upper": lambda: text.upper(),
        "lower": lambda: text.lower(),
        "title": lambda: text.title(),
        "reverse": lambda: text[::-1],
        "split": lambda: text.split(kwargs.get("delimiter") or None),
        "replace": lambda: text.replace(kwargs.get("old", ""), kwargs.get("new", "")),
        "contains": lambda: kwargs.get("old", "") in text,
        "length": lambda: len(text),
    }
    if op not in ops:
        return {"success": False, "output": None, "error": "unknown operation: %s" % op}
    return {"success": True, "output": ops[op]()}
"#;

fn args(value: Value) -> Arguments {
    match value {
        Value::Object(map) => map,
        _ => Arguments::new(),
    }
}

fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// The built-in capability set.
pub fn builtin_candidates() -> Vec<Candidate> {
    vec![
        Candidate {
            name: "text-analyze".into(),
            entry_point: "text_analyze".into(),
            description: "Analyze text: word count, sentence count, paragraphs, top keywords".into(),
            parameters: params(&[("text", "the text to analyze, defaults to the task text")]),
            source: TEXT_ANALYZE.into(),
            test_cases: vec![
                TestCase::new("basic text", args(json!({"text": "One two three. Four five!"})), true),
                TestCase::new("missing text", Arguments::new(), false),
            ],
        },
        Candidate {
            name: "math-eval".into(),
            entry_point: "math_eval".into(),
            description: "Evaluate a math expression: arithmetic, sqrt, trig, log".into(),
            parameters: params(&[("expression", "math expression, e.g. 'sqrt(16) + 2'")]),
            source: MATH_EVAL.into(),
            test_cases: vec![
                TestCase::new("arithmetic", args(json!({"expression": "sqrt(16) + 2"})), true),
                TestCase::new("division by zero", args(json!({"expression": "1/0"})), false),
            ],
        },
        Candidate {
            name: "json-query".into(),
            entry_point: "json_query".into(),
            description: "Parse a JSON string and query it with a dot-notation path".into(),
            parameters: params(&[
                ("json_string", "raw JSON string"),
                ("query", "optional dot path, e.g. 'data.users.0.name'"),
            ]),
            source: JSON_QUERY.into(),
            test_cases: vec![
                TestCase::new(
                    "nested path",
                    args(json!({"json_string": "{\"a\": [{\"b\": 1}]}", "query": "a.0.b"})),
                    true,
                ),
                TestCase::new("invalid json", args(json!({"json_string": "{"})), false),
            ],
        },
        Candidate {
            name: "string-transform".into(),
            entry_point: "string_transform".into(),
            description: "Transform strings: upper, lower, title, reverse, split, replace, contains, length".into(),
            parameters: params(&[
                ("text", "input string"),
                ("operation", "operation name"),
                ("delimiter", "optional, for split"),
                ("old", "optional, for replace and contains"),
                ("new", "optional, for replace"),
            ]),
            source: STRING_TRANSFORM.into(),
            test_cases: vec![
                TestCase::new("upper", args(json!({"text": "abc", "operation": "upper"})), true),
                TestCase::new("unknown op", args(json!({"text": "abc", "operation": "explode"})), false),
            ],
        },
    ]
}
