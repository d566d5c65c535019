//! Tables, procedures, and statements.

use hashbrown::HashMap;

use hornet_common::ids::{ColumnId, ProcId, StmtId, TableId};

use crate::conflicts::{ConflictKind, ConflictPair};
use crate::mappings::{ParameterMapping, ParameterMappings};

/// One table of the partitioned database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDef {
    /// Dense catalog id; doubles as the index into table bitmaps.
    pub id: TableId,
    /// Catalog name.
    pub name: String,
    /// Primary-key columns in declaration order.
    pub primary_key: Vec<ColumnId>,
}

/// A statement parameter that binds one primary-key column of a table the
/// statement predicates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PkeyBinding {
    /// Table whose primary key is bound.
    pub table: TableId,
    /// The bound primary-key column.
    pub column: ColumnId,
    /// Position of the binding parameter inside the statement's parameter
    /// list.
    pub stmt_param: usize,
}

/// One precompiled statement of a stored procedure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementDef {
    /// Dense catalog id.
    pub id: StmtId,
    /// Catalog name, unique inside the owning procedure.
    pub name: String,
    /// Owning procedure.
    pub proc: ProcId,
    /// Tables referenced by the statement.
    pub tables: Vec<TableId>,
    /// Whether the statement mutates any of its tables.
    pub writes: bool,
    /// Primary-key bindings used by the query-estimate conflict checker.
    pub pkey_bindings: Vec<PkeyBinding>,
}

/// One stored procedure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcedureDef {
    /// Dense catalog id; doubles as the index into conflict bitsets.
    pub id: ProcId,
    /// Catalog name.
    pub name: String,
    /// Whether the procedure never writes.
    pub read_only: bool,
    /// System procedures never participate in conflict analysis.
    pub system: bool,
    /// Statements in declaration order.
    pub statements: Vec<StmtId>,
}

/// Immutable catalog snapshot. Ids are dense and double as vector indexes.
#[derive(Debug)]
pub struct Catalog {
    tables: Vec<TableDef>,
    procedures: Vec<ProcedureDef>,
    statements: Vec<StatementDef>,
    conflicts: Vec<ConflictPair>,
    mappings: ParameterMappings,
    table_names: HashMap<String, TableId>,
    procedure_names: HashMap<String, ProcId>,
}

impl Catalog {
    /// Looks up a table by id.
    #[must_use]
    pub fn table(&self, id: TableId) -> Option<&TableDef> {
        self.tables.get(usize::from(id))
    }

    /// Looks up a table by name.
    #[must_use]
    pub fn table_by_name(&self, name: &str) -> Option<&TableDef> {
        self.table_names.get(name).and_then(|id| self.table(*id))
    }

    /// Looks up a procedure by id.
    #[must_use]
    pub fn procedure(&self, id: ProcId) -> Option<&ProcedureDef> {
        self.procedures.get(usize::from(id))
    }

    /// Looks up a procedure by name.
    #[must_use]
    pub fn procedure_by_name(&self, name: &str) -> Option<&ProcedureDef> {
        self.procedure_names
            .get(name)
            .and_then(|id| self.procedure(*id))
    }

    /// Looks up a statement by id.
    #[must_use]
    pub fn statement(&self, id: StmtId) -> Option<&StatementDef> {
        self.statements.get(usize::from(id))
    }

    /// Number of tables in the catalog.
    #[must_use]
    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    /// Number of procedures in the catalog.
    #[must_use]
    pub fn procedure_count(&self) -> usize {
        self.procedures.len()
    }

    /// Iterates all procedures.
    pub fn procedures(&self) -> impl Iterator<Item = &ProcedureDef> {
        self.procedures.iter()
    }

    /// Iterates all declared conflict pairs.
    pub fn conflict_pairs(&self) -> impl Iterator<Item = &ConflictPair> {
        self.conflicts.iter()
    }

    /// Iterates conflict pairs declared from `proc0` against `proc1`.
    pub fn conflict_pairs_between(
        &self,
        proc0: ProcId,
        proc1: ProcId,
    ) -> impl Iterator<Item = &ConflictPair> {
        self.conflicts
            .iter()
            .filter(move |pair| pair.proc0 == proc0 && pair.proc1 == proc1)
    }

    /// Finds the conflict pair registered for an ordered statement pair.
    #[must_use]
    pub fn conflict_pair_for_statements(&self, stmt0: StmtId, stmt1: StmtId) -> Option<&ConflictPair> {
        self.conflicts
            .iter()
            .find(|pair| pair.stmt0 == stmt0 && pair.stmt1 == stmt1)
    }

    /// Parameter-mapping lookup table.
    #[must_use]
    pub fn mappings(&self) -> &ParameterMappings {
        &self.mappings
    }
}

/// Programmatic catalog construction.
///
/// Catalog compilation from SQL lives outside this engine; embedders build
/// the snapshot directly through this builder.
#[derive(Debug, Default)]
pub struct CatalogBuilder {
    tables: Vec<TableDef>,
    procedures: Vec<ProcedureDef>,
    statements: Vec<StatementDef>,
    conflicts: Vec<ConflictPair>,
    mappings: ParameterMappings,
}

impl CatalogBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a table and returns its id.
    pub fn table(&mut self, name: &str, primary_key: Vec<ColumnId>) -> TableId {
        let id = TableId::try_from(self.tables.len()).unwrap_or(TableId::MAX);
        self.tables.push(TableDef {
            id,
            name: name.to_owned(),
            primary_key,
        });
        id
    }

    /// Declares a procedure and returns its id.
    pub fn procedure(&mut self, name: &str, read_only: bool) -> ProcId {
        self.procedure_with_flags(name, read_only, false)
    }

    /// Declares a procedure with an explicit system flag.
    pub fn procedure_with_flags(&mut self, name: &str, read_only: bool, system: bool) -> ProcId {
        let id = ProcId::try_from(self.procedures.len()).unwrap_or(ProcId::MAX);
        self.procedures.push(ProcedureDef {
            id,
            name: name.to_owned(),
            read_only,
            system,
            statements: Vec::new(),
        });
        id
    }

    /// Declares a statement inside a procedure and returns its id.
    pub fn statement(
        &mut self,
        proc: ProcId,
        name: &str,
        tables: Vec<TableId>,
        writes: bool,
        pkey_bindings: Vec<PkeyBinding>,
    ) -> StmtId {
        let id = StmtId::try_from(self.statements.len()).unwrap_or(StmtId::MAX);
        self.statements.push(StatementDef {
            id,
            name: name.to_owned(),
            proc,
            tables,
            writes,
            pkey_bindings,
        });
        if let Some(owner) = self.procedures.get_mut(usize::from(proc)) {
            owner.statements.push(id);
        }
        id
    }

    /// Declares a conflict pair between two statements.
    pub fn conflict(
        &mut self,
        stmt0: StmtId,
        stmt1: StmtId,
        tables: Vec<TableId>,
        kind: ConflictKind,
    ) -> &mut Self {
        let proc0 = self
            .statements
            .get(usize::from(stmt0))
            .map_or(ProcId::MAX, |stmt| stmt.proc);
        let proc1 = self
            .statements
            .get(usize::from(stmt1))
            .map_or(ProcId::MAX, |stmt| stmt.proc);
        self.conflicts.push(ConflictPair {
            proc0,
            proc1,
            stmt0,
            stmt1,
            tables,
            kind,
        });
        self
    }

    /// Declares a parameter mapping.
    pub fn mapping(&mut self, mapping: ParameterMapping) -> &mut Self {
        self.mappings.insert(mapping);
        self
    }

    /// Finalizes the snapshot.
    #[must_use]
    pub fn build(self) -> Catalog {
        let table_names = self
            .tables
            .iter()
            .map(|table| (table.name.clone(), table.id))
            .collect();
        let procedure_names = self
            .procedures
            .iter()
            .map(|proc| (proc.name.clone(), proc.id))
            .collect();
        Catalog {
            tables: self.tables,
            procedures: self.procedures,
            statements: self.statements,
            conflicts: self.conflicts,
            mappings: self.mappings,
            table_names,
            procedure_names,
        }
    }
}
