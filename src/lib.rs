pub mod config;
pub mod connectors;
pub mod db;
pub mod graph;
pub mod handlers;
pub mod ingest;
pub mod models;
pub mod resolver;
pub mod schema;
pub mod server;
pub mod store;
pub mod upsert;
pub mod visibility;

use std::collections::HashSet;
use std::ops::ControlFlow;

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use sqlparser::ast::{
    Ident, ObjectName, ObjectNamePart, Query, Statement, TableFactor, TableObject, Visit, Visitor,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::{Parser, ParserError};
use tracing::debug;

/// Tables read and written by a SQL text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRefs {
    pub sources: Vec<String>,
    pub targets: Vec<String>,
}

/// Extracts table references, yielding empty lists when the SQL does not parse.
pub fn extract_table_refs(sql: &str) -> TableRefs {
    match try_extract_table_refs(sql) {
        Ok(refs) => refs,
        Err(e) => {
            debug!("sql parse failed, no table references extracted: {}", e);
            TableRefs::default()
        }
    }
}

/// Parses every statement in `sql` and collects dotted table names.
///
/// Sources are every referenced table in traversal order: the written table
/// first, then FROM/JOIN positions anywhere (CTE bodies and subqueries
/// included), minus CTE names. Targets are the tables named by `INSERT INTO`,
/// `CREATE TABLE [AS]` and `CREATE VIEW`. Both lists keep first-occurrence
/// order without duplicates.
pub fn try_extract_table_refs(sql: &str) -> Result<TableRefs, ParserError> {
    let statements = Parser::parse_sql(&GenericDialect {}, sql)?;
    let mut collector = TableRefCollector::default();
    let _ = statements.visit(&mut collector);

    Ok(TableRefs {
        sources: collector.sources.into_iter().unique().collect(),
        targets: collector.targets.into_iter().unique().collect(),
    })
}

#[derive(Debug, Default)]
struct TableRefCollector {
    sources: Vec<String>,
    targets: Vec<String>,
    // lower-cased CTE names of the current statement
    ctes: HashSet<String>,
}

impl Visitor for TableRefCollector {
    type Break = ();

    fn pre_visit_statement(&mut self, statement: &Statement) -> ControlFlow<Self::Break> {
        self.ctes.clear();
        let target = match statement {
            Statement::CreateTable(ct) => Some(&ct.name),
            Statement::CreateView { name, .. } => Some(name),
            Statement::Insert(ins) => match &ins.table {
                TableObject::TableName(name) => Some(name),
                TableObject::TableFunction(_) => None,
            },
            _ => None,
        };
        // The written table is also a referenced one.
        if let Some(name) = target.and_then(dotted_name) {
            self.sources.push(name.clone());
            self.targets.push(name);
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                self.ctes
                    .insert(ident_to_string(&cte.alias.name).to_lowercase());
            }
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_table_factor(&mut self, factor: &TableFactor) -> ControlFlow<Self::Break> {
        if let TableFactor::Table { name, .. } = factor {
            if let Some(name) = dotted_name(name) {
                if !self.ctes.contains(&name.to_lowercase()) {
                    self.sources.push(name);
                }
            }
        }
        ControlFlow::Continue(())
    }
}

fn ident_to_string(ident: &Ident) -> String {
    ident.value.clone()
}

/// `[catalog.]schema.name` without quoting; `None` for function-valued parts.
fn dotted_name(name: &ObjectName) -> Option<String> {
    let mut parts: Vec<String> = Vec::with_capacity(name.0.len());
    for part in &name.0 {
        match part {
            ObjectNamePart::Identifier(ident) => parts.push(ident_to_string(ident)),
            #[allow(unreachable_patterns)]
            _ => return None,
        }
    }
    Some(parts.join("."))
}
