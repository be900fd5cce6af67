pub mod devlink {
    pub mod v1 {
        /// Invocation of a named server-side feature.
        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct FeatureRequest {
            #[prost(string, tag = "1")]
            pub name: ::prost::alloc::string::String,
            #[prost(map = "string, string", tag = "2")]
            pub args: ::std::collections::HashMap<
                ::prost::alloc::string::String,
                ::prost::alloc::string::String,
            >,
        }

        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct ErrorInfo {
            #[prost(string, tag = "1")]
            pub error_trace: ::prost::alloc::string::String,
        }

        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct FeatureResponse {
            #[prost(string, optional, tag = "1")]
            pub response: ::core::option::Option<::prost::alloc::string::String>,
            #[prost(message, optional, tag = "2")]
            pub error_info: ::core::option::Option<ErrorInfo>,
        }
    }
}
