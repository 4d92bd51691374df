//! Grammar for `LOAD DATA [LOCAL] INFILE` statements and S3-style object
//! URLs. Only the head of the statement is parsed; everything after the
//! table identifier is kept verbatim for the rewritten statement.

use winnow::ascii::{multispace0, multispace1, Caseless};
use winnow::combinator::{alt, delimited, opt, terminated};
use winnow::prelude::*;
use winnow::token::{literal, take_till, take_while};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Url {
    pub bucket: String,
    pub filename: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadDataInfile {
    pub local: bool,
    pub filename: String,
    pub db: Option<String>,
    pub table: String,
    pub remaining_sql: String,
}

impl LoadDataInfile {
    /// The table part with identifier quoting, `db`.`table` or `table`.
    pub fn quoted_table(&self) -> String {
        match &self.db {
            Some(db) => format!("`{db}`.`{}`", self.table),
            None => format!("`{}`", self.table),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub message: String,
}

fn identifier(input: &mut &str) -> PResult<String> {
    alt((
        delimited('`', take_till(1.., '`'), '`').map(str::to_string),
        take_while(1.., |c: char| c.is_alphanumeric() || "_@$".contains(c)).map(str::to_string),
    ))
    .parse_next(input)
}

fn quoted_str(input: &mut &str) -> PResult<String> {
    alt((
        delimited('\'', take_till(1.., '\''), '\'').map(str::to_string),
        delimited('"', take_till(1.., '"'), '"').map(str::to_string),
    ))
    .parse_next(input)
}

fn table_identifier(input: &mut &str) -> PResult<(Option<String>, String)> {
    let first = identifier.parse_next(input)?;
    match opt(('.', identifier)).parse_next(input)? {
        Some((_, second)) => Ok((Some(first), second)),
        None => Ok((None, first)),
    }
}

fn ldi_statement(input: &mut &str) -> PResult<LoadDataInfile> {
    multispace0.parse_next(input)?;
    literal(Caseless("LOAD")).parse_next(input)?;
    multispace1.parse_next(input)?;
    literal(Caseless("DATA")).parse_next(input)?;
    multispace1.parse_next(input)?;
    let local = opt(terminated(literal(Caseless("LOCAL")), multispace1))
        .parse_next(input)?
        .is_some();
    literal(Caseless("INFILE")).parse_next(input)?;
    multispace1.parse_next(input)?;
    let filename = quoted_str.parse_next(input)?;
    multispace1.parse_next(input)?;
    literal(Caseless("INTO")).parse_next(input)?;
    multispace1.parse_next(input)?;
    literal(Caseless("TABLE")).parse_next(input)?;
    multispace1.parse_next(input)?;
    let (db, table) = table_identifier.parse_next(input)?;
    let remaining_sql = input.trim().to_string();
    *input = "";
    Ok(LoadDataInfile {
        local,
        filename,
        db,
        table,
        remaining_sql,
    })
}

fn s3_url(input: &mut &str) -> PResult<S3Url> {
    alt((literal(Caseless("s3://")), literal(Caseless("gs://")))).parse_next(input)?;
    let bucket = take_while(1.., |c: char| c.is_alphanumeric() || ".-".contains(c))
        .parse_next(input)?
        .to_string();
    '/'.parse_next(input)?;
    let filename = take_while(1.., |c: char| c.is_alphanumeric() || "./-_".contains(c))
        .parse_next(input)?
        .to_string();
    winnow::combinator::eof.parse_next(input)?;
    Ok(S3Url { bucket, filename })
}

pub fn parse_ldi(sql: &str) -> Result<LoadDataInfile, ParseError> {
    let mut input = sql;
    ldi_statement(&mut input).map_err(|e| ParseError {
        message: format!("not a LOAD DATA INFILE statement: {e}"),
    })
}

pub fn parse_s3_url(url: &str) -> Result<S3Url, ParseError> {
    let mut input = url;
    s3_url(&mut input).map_err(|e| ParseError {
        message: format!("not an S3 URL: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic_ldi() {
        let ldi =
            parse_ldi("LOAD DATA LOCAL INFILE 'x.csv' INTO TABLE t FIELDS TERMINATED BY ','")
                .unwrap();
        assert!(ldi.local);
        assert_eq!(ldi.filename, "x.csv");
        assert_eq!(ldi.db, None);
        assert_eq!(ldi.table, "t");
        assert_eq!(ldi.remaining_sql, "FIELDS TERMINATED BY ','");
    }

    #[test]
    fn test_parse_without_local_and_with_db() {
        let ldi = parse_ldi("load data infile \"/tmp/f.csv\" into table test.`my table`").unwrap();
        assert!(!ldi.local);
        assert_eq!(ldi.db.as_deref(), Some("test"));
        assert_eq!(ldi.table, "my table");
        assert_eq!(ldi.quoted_table(), "`test`.`my table`");
        assert_eq!(ldi.remaining_sql, "");
    }

    #[test]
    fn test_parse_s3_filename() {
        let ldi = parse_ldi("LOAD DATA LOCAL INFILE 's3://bkt/data.csv' INTO TABLE t").unwrap();
        let url = parse_s3_url(&ldi.filename).unwrap();
        assert_eq!(url.bucket, "bkt");
        assert_eq!(url.filename, "data.csv");
    }

    #[test]
    fn test_gs_prefix_and_nested_path() {
        let url = parse_s3_url("gs://my-bucket.eu/data/part-01.csv").unwrap();
        assert_eq!(url.bucket, "my-bucket.eu");
        assert_eq!(url.filename, "data/part-01.csv");
    }

    #[test]
    fn test_rejects_non_ldi() {
        assert!(parse_ldi("SELECT 1").is_err());
        assert!(parse_ldi("LOAD DATA INFILE missing_quotes INTO TABLE t").is_err());
        assert!(parse_s3_url("http://example.com/f.csv").is_err());
        assert!(parse_s3_url("s3://bucket-only").is_err());
    }
}
