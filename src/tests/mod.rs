#[cfg(test)]
mod tests {
    use crate::pipeline::{
        Analyzer, BoxError, IngestRequest, MetaInfo, ParsedProcess, ProcessService, QueryRequest, RecordParser,
    };
    use async_trait::async_trait;
    use chrono::Utc;
    use mockall::*;
    use procstore_core::engine::IngestAck;
    use procstore_core::query::{AggregateRow, QueryDescriptor, QueryOutput, ResultRows, ResultSet, ResultSource};
    use procstore_core::record::{OsKind, ProcessSample, RecordId};
    use procstore_core::{GroupDimension, Metric};
    use std::collections::BTreeMap;

    mock! {
        pub Parser {}
        impl RecordParser for Parser {
            fn parse(&self, content: &str, os_kind: OsKind) -> Result<Vec<ParsedProcess>, BoxError>;
        }
    }

    mock! {
        pub Service {}
        #[async_trait]
        impl ProcessService for Service {
            async fn ingest(&self, sample: ProcessSample) -> Result<IngestAck, BoxError>;
            async fn query(&self, descriptor: QueryDescriptor) -> Result<ResultSet, BoxError>;
        }
    }

    fn process(name: &str, cpu: f64) -> ParsedProcess {
        ParsedProcess {
            process_name: name.to_string(),
            pid: Some(1),
            cpu_usage: cpu,
            mem_usage: 2048,
            user: Some("root".to_string()),
            extra: BTreeMap::new(),
        }
    }

    fn ack(position: usize) -> IngestAck {
        IngestAck {
            accepted: true,
            queued_position: position,
            record_id: RecordId::new(),
        }
    }

    fn upload(content: &str) -> IngestRequest {
        IngestRequest {
            os_type: Some("linux".to_string()),
            content: content.to_string(),
            meta_info: MetaInfo {
                timestamp: Some(Utc::now()),
                machine_id: Some("web-01".to_string()),
                machine_name: Some("web".to_string()),
            },
        }
    }

    #[tokio::test]
    async fn test_upload_is_parsed_and_ingested() {
        let mut mock_parser = MockParser::new();
        let mut mock_service = MockService::new();

        mock_parser
            .expect_parse()
            .withf(|content, os_kind| content.contains("nginx") && *os_kind == OsKind::Unix)
            .times(1)
            .return_once(|_, _| Ok(vec![process("nginx", 3.0), process("redis", 1.5)]));

        mock_service
            .expect_ingest()
            .withf(|sample| sample.machine_id == "web-01" && sample.machine_name.as_deref() == Some("web"))
            .times(2)
            .returning(|_| Ok(ack(0)));

        let analyzer = Analyzer::new(Box::new(mock_parser), Box::new(mock_service));
        let summary = analyzer.ingest_raw(upload("nginx 3.0\nredis 1.5")).await.unwrap();

        assert_eq!(summary.records_processed, 2);
        assert_eq!(summary.accepted, 2);
        assert_eq!(summary.rejected, 0);
    }

    #[tokio::test]
    async fn test_rejected_samples_are_counted() {
        let mut mock_parser = MockParser::new();
        let mut mock_service = MockService::new();

        mock_parser
            .expect_parse()
            .return_once(|_, _| Ok(vec![process("good", 1.0), process("bad", 2.0)]));

        mock_service.expect_ingest().times(2).returning(|sample| {
            if sample.process_name == "bad" {
                Err("buffer full".into())
            } else {
                Ok(ack(1))
            }
        });

        let analyzer = Analyzer::new(Box::new(mock_parser), Box::new(mock_service));
        let summary = analyzer.ingest_raw(upload("good\nbad")).await.unwrap();

        assert_eq!(summary.accepted, 1);
        assert_eq!(summary.rejected, 1);
    }

    #[tokio::test]
    async fn test_missing_fields_are_rejected() {
        let mock_parser = MockParser::new();
        let mock_service = MockService::new();
        let analyzer = Analyzer::new(Box::new(mock_parser), Box::new(mock_service));

        let mut request = upload("");
        request.os_type = None;
        let err = analyzer.ingest_raw(request).await.unwrap_err();
        assert!(err.to_string().contains("Missing required fields"));

        let mut request = upload("nginx 3.0");
        request.meta_info.machine_id = None;
        assert!(analyzer.ingest_raw(request).await.is_err());
    }

    #[tokio::test]
    async fn test_parse_error_propagates() {
        let mut mock_parser = MockParser::new();
        let mock_service = MockService::new();

        mock_parser
            .expect_parse()
            .times(1)
            .return_once(|_, _| Err("unrecognized ps header".into()));

        let analyzer = Analyzer::new(Box::new(mock_parser), Box::new(mock_service));
        let result = analyzer.ingest_raw(upload("garbage")).await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("ps header"));
    }

    #[tokio::test]
    async fn test_query_is_normalized_before_execution() {
        let mock_parser = MockParser::new();
        let mut mock_service = MockService::new();

        mock_service
            .expect_query()
            .withf(|descriptor| {
                descriptor.output == QueryOutput::Aggregates
                    && descriptor.metrics == vec![Metric::ProcessCount, Metric::AvgCpu]
                    && descriptor.machine_id.as_deref() == Some("web-01")
            })
            .times(1)
            .return_once(|_| {
                Ok(ResultSet {
                    rows: ResultRows::Aggregates(vec![
                        AggregateRow {
                            bucket: None,
                            group: BTreeMap::new(),
                            metric: Metric::ProcessCount,
                            value: Some(4.0),
                            sample_count: 4,
                        },
                        AggregateRow {
                            bucket: None,
                            group: BTreeMap::new(),
                            metric: Metric::AvgCpu,
                            value: Some(12.5),
                            sample_count: 4,
                        },
                    ]),
                    source: ResultSource::Cache,
                    as_of: Utc::now(),
                })
            });

        let analyzer = Analyzer::new(Box::new(mock_parser), Box::new(mock_service));
        let response = analyzer
            .query(QueryRequest {
                machine_id: Some("web-01".to_string()),
                aggregations: Some(vec!["avg_cpu_usage".to_string(), "process_count".to_string()]),
                ..QueryRequest::default()
            })
            .await
            .unwrap();

        assert_eq!(response.total_count, 2);
        assert_eq!(response.source, ResultSource::Cache);
    }

    #[tokio::test]
    async fn test_grouped_aggregate_query_keeps_paging() {
        let mock_parser = MockParser::new();
        let mut mock_service = MockService::new();

        mock_service
            .expect_query()
            .withf(|descriptor| {
                descriptor.output == QueryOutput::Aggregates
                    && descriptor.group_by == vec![GroupDimension::MachineId]
                    && descriptor.limit == Some(2)
                    && descriptor.offset == 1
            })
            .times(1)
            .return_once(|_| {
                Ok(ResultSet {
                    rows: ResultRows::Aggregates(vec![AggregateRow {
                        bucket: None,
                        group: BTreeMap::from([(GroupDimension::MachineId, "web-02".to_string())]),
                        metric: Metric::AvgCpu,
                        value: Some(7.5),
                        sample_count: 2,
                    }]),
                    source: ResultSource::Store,
                    as_of: Utc::now(),
                })
            });

        let analyzer = Analyzer::new(Box::new(mock_parser), Box::new(mock_service));
        let response = analyzer
            .query(QueryRequest {
                aggregations: Some(vec!["avg_cpu_usage".to_string()]),
                group_by: Some(vec!["machine_id".to_string()]),
                limit: Some(2),
                offset: Some(1),
                ..QueryRequest::default()
            })
            .await
            .unwrap();

        assert_eq!(response.total_count, 1);
        assert_eq!(response.source, ResultSource::Store);
    }

    #[tokio::test]
    async fn test_query_error_propagates() {
        let mock_parser = MockParser::new();
        let mut mock_service = MockService::new();

        mock_service
            .expect_query()
            .times(1)
            .return_once(|_| Err("query timed out".into()));

        let analyzer = Analyzer::new(Box::new(mock_parser), Box::new(mock_service));
        let result = analyzer.query(QueryRequest::default()).await;
        assert!(result.is_err());
    }
}
