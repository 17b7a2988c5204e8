//! Per-provider search expressions built from a user's lab directory.

use crate::db::models::Lab;
use crate::error::IngestError;

struct LabTerms<'a> {
    name: Option<&'a str>,
    email: Option<&'a str>,
}

fn lab_terms(labs: &[Lab]) -> Result<Vec<LabTerms<'_>>, IngestError> {
    let terms: Vec<LabTerms<'_>> = labs
        .iter()
        .map(|lab| LabTerms {
            name: Some(lab.lab_name.trim()).filter(|name| !name.is_empty()),
            email: lab
                .lab_email
                .as_deref()
                .map(str::trim)
                .filter(|email| !email.is_empty()),
        })
        .filter(|terms| terms.name.is_some() || terms.email.is_some())
        .collect();

    if terms.is_empty() {
        return Err(IngestError::EmptyLabDirectory);
    }
    Ok(terms)
}

/// `has:attachment {from:a@lab.test "Lab Name" ...}`
pub fn gmail_filter(labs: &[Lab]) -> Result<String, IngestError> {
    let mut clauses = Vec::new();
    for lab in lab_terms(labs)? {
        if let Some(email) = lab.email {
            clauses.push(format!("from:{email}"));
        }
        if let Some(name) = lab.name {
            clauses.push(format!("\"{}\"", name.replace('"', "")));
        }
    }
    Ok(format!("has:attachment {{{}}}", clauses.join(" ")))
}

/// OData `$filter` for the Graph messages endpoint.
pub fn graph_filter(labs: &[Lab]) -> Result<String, IngestError> {
    let mut clauses = Vec::new();
    for lab in lab_terms(labs)? {
        if let Some(email) = lab.email {
            clauses.push(format!(
                "from/emailAddress/address eq '{}'",
                odata_quote(email)
            ));
        }
        if let Some(name) = lab.name {
            clauses.push(format!("contains(subject,'{}')", odata_quote(name)));
        }
    }
    Ok(format!(
        "hasAttachments eq true and ({})",
        clauses.join(" or ")
    ))
}

/// IMAP `UID SEARCH` criteria, OR-folded in prefix form.
pub fn imap_filter(labs: &[Lab]) -> Result<String, IngestError> {
    let mut keys = Vec::new();
    for lab in lab_terms(labs)? {
        if let Some(email) = lab.email {
            keys.push(format!("FROM {}", imap_quote(email)));
        }
        if let Some(name) = lab.name {
            keys.push(format!("SUBJECT {}", imap_quote(name)));
        }
    }

    let mut keys = keys.into_iter().rev();
    let mut expression = keys.next().ok_or(IngestError::EmptyLabDirectory)?;
    for key in keys {
        expression = format!("OR {key} {expression}");
    }
    Ok(expression)
}

fn odata_quote(value: &str) -> String {
    value.replace('\'', "''")
}

fn imap_quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}
