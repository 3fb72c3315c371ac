use super::*;
use axum::http::HeaderMap;
use std::collections::HashMap;

#[cfg(test)]
mod extract_bearer_token_tests {
    use super::*;

    #[test]
    fn valid_bearer_token() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "authorization",
            "Bearer 550e8400-e29b-41d4-a716-446655440000"
                .parse()
                .unwrap(),
        );

        let result = extract_bearer_token(&headers);
        assert!(result.is_ok());
        assert_eq!(result.unwrap(), "550e8400-e29b-41d4-a716-446655440000");
    }

    #[test]
    fn valid_bearer_token_with_extra_whitespace() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "authorization",
            "Bearer   550e8400-e29b-41d4-a716-446655440000  "
                .parse()
                .unwrap(),
        );

        let result = extract_bearer_token(&headers);
        assert!(result.is_ok());
        assert_eq!(result.unwrap(), "550e8400-e29b-41d4-a716-446655440000");
    }

    #[test]
    fn case_insensitive_bearer() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "authorization",
            "bearer 550e8400-e29b-41d4-a716-446655440000"
                .parse()
                .unwrap(),
        );

        let result = extract_bearer_token(&headers);
        assert!(result.is_ok());
        assert_eq!(result.unwrap(), "550e8400-e29b-41d4-a716-446655440000");
    }

    #[test]
    fn missing_authorization_header() {
        let headers = HeaderMap::new();
        let result = extract_bearer_token(&headers);
        assert_eq!(result, Err(TokenError::Missing));
    }

    #[test]
    fn missing_bearer_prefix() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "authorization",
            "550e8400-e29b-41d4-a716-446655440000".parse().unwrap(),
        );

        let result = extract_bearer_token(&headers);
        assert_eq!(result, Err(TokenError::InvalidFormat));
    }

    #[test]
    fn wrong_auth_scheme() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Basic dXNlcjpwYXNz".parse().unwrap());

        let result = extract_bearer_token(&headers);
        assert_eq!(result, Err(TokenError::InvalidFormat));
    }

    #[test]
    fn bearer_without_token() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer".parse().unwrap());

        let result = extract_bearer_token(&headers);
        assert_eq!(result, Err(TokenError::InvalidFormat));
    }

    #[test]
    fn bearer_with_empty_token() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer  ".parse().unwrap());

        let result = extract_bearer_token(&headers);
        assert_eq!(result, Err(TokenError::Empty));
    }
}

#[cfg(test)]
mod extract_query_token_tests {
    use super::*;

    #[test]
    fn valid_query_token() {
        let mut params = HashMap::new();
        params.insert("token".to_string(), "key_abc123".to_string());

        let result = extract_query_token(&params);
        assert_eq!(result, Ok("key_abc123".to_string()));
    }

    #[test]
    fn missing_token_parameter() {
        let mut params = HashMap::new();
        params.insert("other".to_string(), "value".to_string());

        let result = extract_query_token(&params);
        assert_eq!(result, Err(TokenError::Missing));
    }

    #[test]
    fn empty_token_parameter() {
        let mut params = HashMap::new();
        params.insert("token".to_string(), String::new());

        let result = extract_query_token(&params);
        assert_eq!(result, Err(TokenError::Empty));
    }

    #[test]
    fn empty_params() {
        let params = HashMap::new();
        let result = extract_query_token(&params);
        assert_eq!(result, Err(TokenError::Missing));
    }
}

#[cfg(test)]
mod extract_api_key_tests {
    use super::*;

    #[test]
    fn header_wins_over_query_parameter() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer header_key".parse().unwrap());
        let mut params = HashMap::new();
        params.insert("token".to_string(), "query_key".to_string());

        let result = extract_api_key(&headers, &params);
        assert_eq!(result, Ok("header_key".to_string()));
    }

    #[test]
    fn falls_back_to_query_parameter() {
        let headers = HeaderMap::new();
        let mut params = HashMap::new();
        params.insert("token".to_string(), "query_key".to_string());

        let result = extract_api_key(&headers, &params);
        assert_eq!(result, Ok("query_key".to_string()));
    }

    #[test]
    fn malformed_header_does_not_fall_back() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Basic dXNlcjpwYXNz".parse().unwrap());
        let mut params = HashMap::new();
        params.insert("token".to_string(), "query_key".to_string());

        let result = extract_api_key(&headers, &params);
        assert_eq!(result, Err(TokenError::InvalidFormat));
    }

    #[test]
    fn nothing_provided() {
        let headers = HeaderMap::new();
        let params = HashMap::new();

        let result = extract_api_key(&headers, &params);
        assert_eq!(result, Err(TokenError::Missing));
    }
}

#[cfg(test)]
mod token_error_display_tests {
    use super::*;

    #[test]
    fn missing_error_message() {
        let error = TokenError::Missing;
        assert_eq!(error.to_string(), "API key not provided");
    }

    #[test]
    fn invalid_format_error_message() {
        let error = TokenError::InvalidFormat;
        assert_eq!(error.to_string(), "Invalid API key format");
    }

    #[test]
    fn empty_error_message() {
        let error = TokenError::Empty;
        assert_eq!(error.to_string(), "API key is empty");
    }
}
