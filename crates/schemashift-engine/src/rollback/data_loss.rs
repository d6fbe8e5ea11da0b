use schemashift_core::result::DataLossWarning;
use schemashift_core::types::{DestructiveOp, DestructiveOpKind};

/// One warning per destructive operation in a rollback range.
pub fn classify(domain: &str, ops: &[DestructiveOp]) -> Vec<DataLossWarning> {
    ops.iter()
        .map(|op| {
            let (severity, consequence) = op.kind.classify();
            DataLossWarning {
                domain: domain.to_string(),
                operation: op.kind,
                object: op.object.clone(),
                severity,
                consequence: consequence.to_string(),
            }
        })
        .collect()
}

/// Human-readable line for result warnings.
pub fn describe(w: &DataLossWarning) -> String {
    let op = match w.operation {
        DestructiveOpKind::DropColumn => "column removal",
        DestructiveOpKind::DropTable => "table removal",
        DestructiveOpKind::AlterColumn => "column modification",
    };
    format!(
        "{}: {op} on {} risks {} ({} severity)",
        w.domain, w.object, w.consequence, w.severity
    )
}
