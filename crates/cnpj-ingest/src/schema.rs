//! Schema registry
//!
//! Static declaration of the ten record types published in the CNPJ open data
//! release, their target table names and ordered column lists. Every column is
//! nullable text at load time; [`ColumnKind::Decimal`] marks the one column
//! that gets a best-effort normalisation after parsing.
//!
//! The column order is the upstream file layout. A layout change upstream is a
//! breaking change that has to be reflected here by hand.

use serde::{Deserialize, Serialize};

use crate::error::{IngestError, Result};

/// Shared key column of the four main record types
pub const CNPJ_KEY_COLUMN: &str = "cnpj_basico";

/// Width of a `cnpj_basico` value
pub const CNPJ_KEY_WIDTH: usize = 8;

/// One of the ten logical tables loaded by the pipeline
///
/// Declaration order is the registry order, which is also the order in which
/// record types are processed.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum RecordType {
    /// Company (`EMPRECSV`)
    Empresa,
    /// Establishment (`ESTABELE`)
    Estabelecimento,
    /// Partner (`SOCIOCSV`)
    Socios,
    /// Simplified tax regime election (`SIMPLES.CSV`)
    Simples,
    /// Economic activity codes
    Cnae,
    /// Registration status reason codes
    Moti,
    /// Municipality codes
    Munic,
    /// Legal nature codes
    Natju,
    /// Country codes
    Pais,
    /// Partner qualification codes
    Quals,
}

impl RecordType {
    /// Every record type in registry order
    pub const ALL: [RecordType; 10] = [
        RecordType::Empresa,
        RecordType::Estabelecimento,
        RecordType::Socios,
        RecordType::Simples,
        RecordType::Cnae,
        RecordType::Moti,
        RecordType::Munic,
        RecordType::Natju,
        RecordType::Pais,
        RecordType::Quals,
    ];

    /// Target table name
    pub fn table_name(self) -> &'static str {
        self.schema().table
    }

    pub fn schema(self) -> &'static Schema {
        match self {
            RecordType::Empresa => &EMPRESA,
            RecordType::Estabelecimento => &ESTABELECIMENTO,
            RecordType::Socios => &SOCIOS,
            RecordType::Simples => &SIMPLES,
            RecordType::Cnae => &CNAE,
            RecordType::Moti => &MOTI,
            RecordType::Munic => &MUNIC,
            RecordType::Natju => &NATJU,
            RecordType::Pais => &PAIS,
            RecordType::Quals => &QUALS,
        }
    }

    /// Reference types are the small `codigo;descricao` lookup tables
    pub fn is_reference(self) -> bool {
        self.schema().columns.len() == 2
    }
}

impl std::fmt::Display for RecordType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.table_name())
    }
}

impl std::str::FromStr for RecordType {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_lowercase();
        RecordType::ALL
            .into_iter()
            .find(|t| t.table_name() == wanted)
            .ok_or_else(|| IngestError::Config(format!("Unknown record type: {}", s)))
    }
}

/// Declared kind of a column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Text,
    /// Decimal number written with a comma separator upstream
    Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    pub kind: ColumnKind,
}

const fn text(name: &'static str) -> Column {
    Column {
        name,
        kind: ColumnKind::Text,
    }
}

const fn decimal(name: &'static str) -> Column {
    Column {
        name,
        kind: ColumnKind::Decimal,
    }
}

/// Table layout of one record type
#[derive(Debug, PartialEq, Eq)]
pub struct Schema {
    pub record_type: RecordType,
    pub table: &'static str,
    pub columns: &'static [Column],
}

impl Schema {
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn column_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.columns.iter().map(|c| c.name)
    }

    /// Column carrying the 8-digit CNPJ root, when the table has one
    pub fn key_column(&self) -> Option<&'static str> {
        self.columns
            .first()
            .map(|c| c.name)
            .filter(|name| *name == CNPJ_KEY_COLUMN)
    }
}

/// A parsed record whose arity matches its schema
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    values: Vec<Option<String>>,
}

impl Row {
    /// Build a row from raw field text
    ///
    /// Empty fields become `None`. Decimal columns are normalised with
    /// [`normalize_decimal`]. Fails when the field count differs from the
    /// schema's column count.
    pub fn from_fields<'a, I>(schema: &Schema, fields: I) -> Result<Self>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let values: Vec<Option<String>> = fields
            .into_iter()
            .zip(schema.columns.iter().chain(std::iter::repeat(&TEXT_OVERFLOW)))
            .map(|(raw, column)| {
                if raw.is_empty() {
                    None
                } else if column.kind == ColumnKind::Decimal {
                    Some(normalize_decimal(raw))
                } else {
                    Some(raw.to_string())
                }
            })
            .collect();

        if values.len() != schema.column_count() {
            return Err(IngestError::Arity {
                record_type: schema.record_type,
                expected: schema.column_count(),
                actual: values.len(),
            });
        }

        Ok(Self { values })
    }

    pub fn values(&self) -> &[Option<String>] {
        &self.values
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.values.get(index).and_then(|v| v.as_deref())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

// Pairs with surplus fields so the arity check sees the real count.
const TEXT_OVERFLOW: Column = text("");

/// Best-effort decimal normalisation
///
/// Upstream writes `capital_social` as `1000,00`. The comma becomes a point
/// when the result parses as a number; anything else is kept verbatim so a
/// malformed value never blocks the load.
pub fn normalize_decimal(raw: &str) -> String {
    let candidate = raw.trim().replace(',', ".");
    if candidate.parse::<f64>().is_ok() {
        candidate
    } else {
        raw.to_string()
    }
}

static EMPRESA: Schema = Schema {
    record_type: RecordType::Empresa,
    table: "empresa",
    columns: &[
        text("cnpj_basico"),
        text("razao_social"),
        text("natureza_juridica"),
        text("qualificacao_responsavel"),
        decimal("capital_social"),
        text("porte_empresa"),
        text("ente_federativo_responsavel"),
    ],
};

static ESTABELECIMENTO: Schema = Schema {
    record_type: RecordType::Estabelecimento,
    table: "estabelecimento",
    columns: &[
        text("cnpj_basico"),
        text("cnpj_ordem"),
        text("cnpj_dv"),
        text("identificador_matriz_filial"),
        text("nome_fantasia"),
        text("situacao_cadastral"),
        text("data_situacao_cadastral"),
        text("motivo_situacao_cadastral"),
        text("nome_cidade_exterior"),
        text("pais"),
        text("data_inicio_atividade"),
        text("cnae_fiscal_principal"),
        text("cnae_fiscal_secundaria"),
        text("tipo_logradouro"),
        text("logradouro"),
        text("numero"),
        text("complemento"),
        text("bairro"),
        text("cep"),
        text("uf"),
        text("municipio"),
        text("ddd_1"),
        text("telefone_1"),
        text("ddd_2"),
        text("telefone_2"),
        text("ddd_fax"),
        text("fax"),
        text("correio_eletronico"),
        text("situacao_especial"),
        text("data_situacao_especial"),
    ],
};

static SOCIOS: Schema = Schema {
    record_type: RecordType::Socios,
    table: "socios",
    columns: &[
        text("cnpj_basico"),
        text("identificador_socio"),
        text("nome_socio_razao_social"),
        text("cpf_cnpj_socio"),
        text("qualificacao_socio"),
        text("data_entrada_sociedade"),
        text("pais"),
        text("representante_legal"),
        text("nome_do_representante"),
        text("qualificacao_representante_legal"),
        text("faixa_etaria"),
    ],
};

static SIMPLES: Schema = Schema {
    record_type: RecordType::Simples,
    table: "simples",
    columns: &[
        text("cnpj_basico"),
        text("opcao_pelo_simples"),
        text("data_opcao_simples"),
        text("data_exclusao_simples"),
        text("opcao_mei"),
        text("data_opcao_mei"),
        text("data_exclusao_mei"),
    ],
};

const REFERENCE_COLUMNS: &[Column] = &[text("codigo"), text("descricao")];

static CNAE: Schema = Schema {
    record_type: RecordType::Cnae,
    table: "cnae",
    columns: REFERENCE_COLUMNS,
};

static MOTI: Schema = Schema {
    record_type: RecordType::Moti,
    table: "moti",
    columns: REFERENCE_COLUMNS,
};

static MUNIC: Schema = Schema {
    record_type: RecordType::Munic,
    table: "munic",
    columns: REFERENCE_COLUMNS,
};

static NATJU: Schema = Schema {
    record_type: RecordType::Natju,
    table: "natju",
    columns: REFERENCE_COLUMNS,
};

static PAIS: Schema = Schema {
    record_type: RecordType::Pais,
    table: "pais",
    columns: REFERENCE_COLUMNS,
};

static QUALS: Schema = Schema {
    record_type: RecordType::Quals,
    table: "quals",
    columns: REFERENCE_COLUMNS,
};
